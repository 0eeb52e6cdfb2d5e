/// One encoded unit on its way into the container.
///
/// Built by the drain loop from an encoder output buffer after timestamp
/// rebasing; the muxer consumes it immediately.
#[derive(Clone, Debug, PartialEq)]
pub struct EncodedSample {
    pub payload: Vec<u8>,
    pub presentation_time_us: i64,
    pub is_key_frame: bool,
    pub is_config_data: bool,
    pub track_index: usize,
}

impl EncodedSample {
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}
