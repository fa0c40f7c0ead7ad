pub mod builder;
pub mod edge;
pub mod node;
pub mod tree;
