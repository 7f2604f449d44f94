pub mod assembler;
pub mod decoder;
pub mod frame;

pub use assembler::{FrameOutcome, TurnAssembler};
pub use decoder::{FrameDecoder, Utf8StreamDecoder};
pub use frame::{
    encode_data, encode_error, parse_frame, ErrorBody, FramePayload, StreamFrame, DONE_FRAME,
};
