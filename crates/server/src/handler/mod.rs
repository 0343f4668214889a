pub mod certificates;
pub mod health;
pub mod logs;
pub mod messages;
pub mod models;
pub mod proxy;
pub mod routing;
pub mod status;
