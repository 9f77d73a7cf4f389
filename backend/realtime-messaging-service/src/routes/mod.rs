pub mod history;
pub mod wsroute;
