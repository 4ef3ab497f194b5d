pub mod checkpoint;
pub mod event;
pub mod export;
pub mod feed;
pub mod summary;

pub use checkpoint::*;
pub use event::*;
pub use export::*;
pub use feed::*;
pub use summary::*;
