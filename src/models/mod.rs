pub mod decimal;
pub mod governance;
