pub mod channelizer;
pub mod filter;
pub mod station;

pub use channelizer::{Channelizer, Station};
pub use filter::{blackman_sinc_lpf, LowPassFilter};
pub use station::{PcmSink, StationDsp};
