pub mod apk;
pub mod argv;
pub mod bugreport;
pub mod locator;
pub mod monkey;
pub mod parse;
pub mod runner;
