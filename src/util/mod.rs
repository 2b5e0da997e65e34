pub mod ascii;
pub mod retry;
