//! Repositories for metadata store operations

pub mod step_repository;
pub mod velocity_repository;

pub use step_repository::StepRepository;
pub use velocity_repository::VelocityRepository;
