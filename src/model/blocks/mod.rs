pub mod conv;
pub mod region_decode;
pub mod reorg;

pub use conv::ConvBnLeaky;
pub use region_decode::{GridShape, RegionDecoder, RegionOutput, BOX_ATTRS};
pub use reorg::Reorg;
