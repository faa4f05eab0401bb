pub mod reference;
pub mod venue;

pub use reference::BinanceReferenceClient;
pub use venue::VenueClient;
