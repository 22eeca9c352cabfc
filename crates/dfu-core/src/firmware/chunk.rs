//! Chunk cursor over a part payload.

/// Byte-offset cursor that yields MTU-sized chunks of a part.
///
/// The offset only advances after a chunk is handed out, so a paused
/// upload continues exactly where it stopped.
#[derive(Debug, Clone)]
pub struct ChunkState {
    offset: usize,
    chunk_size: usize,
    data_size: usize,
}

impl ChunkState {
    pub fn new(data_size: usize, chunk_size: usize) -> Self {
        Self {
            offset: 0,
            chunk_size: chunk_size.max(1),
            data_size,
        }
    }

    /// Get next chunk from data, advancing state.
    pub fn next_chunk<'a>(&mut self, data: &'a [u8]) -> Option<&'a [u8]> {
        let end = self.data_size.min(data.len());
        if self.offset >= end {
            return None;
        }

        let chunk_len = (end - self.offset).min(self.chunk_size);
        let chunk = &data[self.offset..self.offset + chunk_len];
        self.offset += chunk_len;

        Some(chunk)
    }

    /// Bytes handed out so far.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn is_done(&self) -> bool {
        self.offset >= self.data_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_state() {
        let data = vec![0u8; 50];
        let mut state = ChunkState::new(data.len(), 20);
        assert!(!state.is_done());

        assert_eq!(state.next_chunk(&data).unwrap().len(), 20);
        assert_eq!(state.next_chunk(&data).unwrap().len(), 20);
        assert_eq!(state.offset(), 40);
        assert!(!state.is_done());
        assert_eq!(state.next_chunk(&data).unwrap().len(), 10);

        assert!(state.is_done());
        assert!(state.next_chunk(&data).is_none());
    }

    #[test]
    fn test_continues_from_offset() {
        let data: Vec<u8> = (0..10).collect();
        let mut state = ChunkState::new(data.len(), 4);

        state.next_chunk(&data);
        let mut resumed = state.clone();
        assert_eq!(resumed.offset(), 4);

        assert_eq!(resumed.next_chunk(&data).unwrap(), &[4, 5, 6, 7]);
        assert_eq!(resumed.next_chunk(&data).unwrap(), &[8, 9]);
    }

    #[test]
    fn test_zero_chunk_size_is_clamped() {
        let data = [1u8, 2];
        let mut state = ChunkState::new(data.len(), 0);
        assert_eq!(state.next_chunk(&data).unwrap(), &[1]);
    }
}
