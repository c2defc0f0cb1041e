/// Scatter/gather list describing the memory regions of one request.
///
/// Ownership moves into the remote volume at submission and comes back with the completion, so
/// read data reaches the caller through [`crate::IoCompletion::buffers`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SgList {
    segments: Vec<Vec<u8>>,
}

impl SgList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_segments(segments: Vec<Vec<u8>>) -> Self {
        Self { segments }
    }

    /// Single zero-filled segment of `len` bytes, handy for reads.
    pub fn zeroed(len: usize) -> Self {
        Self {
            segments: vec![vec![0u8; len]],
        }
    }

    pub fn push(&mut self, segment: Vec<u8>) {
        self.segments.push(segment);
    }

    pub fn segments(&self) -> &[Vec<u8>] {
        &self.segments
    }

    pub fn segments_mut(&mut self) -> &mut [Vec<u8>] {
        &mut self.segments
    }

    /// Sum of all segment lengths.
    pub fn total_len(&self) -> u64 {
        self.segments.iter().map(|seg| seg.len() as u64).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(Vec::is_empty)
    }

    /// Copy the segments into one contiguous buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_len() as usize);
        for seg in &self.segments {
            out.extend_from_slice(seg);
        }
        out
    }

    /// Fill the segments in order from `src`, returning the number of bytes copied.
    pub fn copy_from_slice(&mut self, src: &[u8]) -> usize {
        let mut copied = 0;
        for seg in &mut self.segments {
            let remaining = &src[copied..];
            if remaining.is_empty() {
                break;
            }
            let n = seg.len().min(remaining.len());
            seg[..n].copy_from_slice(&remaining[..n]);
            copied += n;
        }
        copied
    }

    pub fn into_segments(self) -> Vec<Vec<u8>> {
        self.segments
    }
}

impl From<Vec<u8>> for SgList {
    fn from(buf: Vec<u8>) -> Self {
        Self {
            segments: vec![buf],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SgList;

    #[test]
    fn total_len_sums_segments() {
        let sg = SgList::from_segments(vec![vec![0; 512], vec![0; 1024], Vec::new()]);
        assert_eq!(sg.total_len(), 1536);
        assert!(!sg.is_empty());
    }

    #[test]
    fn copy_spans_segments() {
        let mut sg = SgList::from_segments(vec![vec![0; 2], vec![0; 3]]);
        let copied = sg.copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(copied, 4);
        assert_eq!(sg.to_vec(), vec![1, 2, 3, 4, 0]);
    }
}
