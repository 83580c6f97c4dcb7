pub mod accounts;
pub mod config;
pub mod error;
pub mod historical;
pub mod monte_carlo;
pub mod output;
pub mod processes;
pub mod protocol;
pub mod simulation;
pub mod steps;
