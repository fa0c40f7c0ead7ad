pub mod get_model;
pub mod rate_matrix_model;
