pub mod alphabet;
pub mod constants;
pub mod graph;
pub mod io;
pub mod likelihood;
pub mod model;
pub mod optimize;
pub mod patterns;
pub mod rates;
pub mod utils;
