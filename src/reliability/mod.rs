pub mod circuit;
pub mod fault;
pub mod retry;
