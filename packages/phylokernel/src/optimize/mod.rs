pub mod branch_length;
