pub mod engine;
pub mod offers;
pub mod ports;
pub mod reserver;
pub mod strategy;

pub use engine::PlacementEngine;
pub use offers::OfferService;
pub use reserver::Reserver;
pub use strategy::{Assignment, BatchStrategy, LabelStrategy, OfferLease, PlacementStrategy};
