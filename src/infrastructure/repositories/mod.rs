pub mod in_memory;

pub use in_memory::{
    InMemoryAlertRepository, InMemoryCandleRepository, InMemoryWatchlistRepository,
};
