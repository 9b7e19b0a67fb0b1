pub mod candle_store;
pub mod tick_buffer;

pub use candle_store::{Candle, CandleSeries, CandleStore};
pub use tick_buffer::TickBuffer;
