pub mod info;
pub mod simulations;
