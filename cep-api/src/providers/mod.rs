pub mod brasilapi;
pub mod correios;
pub mod viacep;
