pub mod dispatcher;
pub mod engine;
pub mod routing;
pub mod watcher;
