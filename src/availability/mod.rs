mod availability_map;
mod bit_array;

pub use availability_map::AvailabilityMap;
pub use bit_array::BitArray;
