pub mod pattern_table;
