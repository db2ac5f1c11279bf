pub mod echo;
pub mod rules;
