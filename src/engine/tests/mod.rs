pub mod helpers;
mod tests_clear;
