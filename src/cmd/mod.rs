pub mod plugins;
pub mod serve;
