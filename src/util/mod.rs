pub mod base64;
pub mod buf_ext;
pub mod random;
pub mod ring_buffer;
pub mod rolling_data;
pub mod safe_converter;
