use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

/// The most recent output of a session, bounded in bytes.
///
/// Replayed to every connection when it attaches, so a client joining a
/// running terminal sees the current screen's worth of context.
#[derive(Debug, Default)]
pub(crate) struct OutputHistory {
    chunks: VecDeque<Bytes>,
    bytes: usize,
    limit: usize,
}

impl OutputHistory {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            bytes: 0,
            limit,
        }
    }

    pub(crate) fn push(&mut self, chunk: &Bytes) {
        if self.limit == 0 || chunk.is_empty() {
            return;
        }
        if chunk.len() >= self.limit {
            self.chunks.clear();
            let tail = chunk.slice(chunk.len() - self.limit..);
            let tail = skip_continuation_bytes(tail);
            self.bytes = tail.len();
            self.chunks.push_back(tail);
            return;
        }

        self.chunks.push_back(chunk.clone());
        self.bytes += chunk.len();
        while self.bytes > self.limit {
            let Some(front) = self.chunks.pop_front() else {
                break;
            };
            let excess = self.bytes - self.limit;
            if front.len() > excess {
                // keep the part of the oldest chunk that still fits
                let rest = skip_continuation_bytes(front.slice(excess..));
                self.bytes = self.bytes - front.len() + rest.len();
                if !rest.is_empty() {
                    self.chunks.push_front(rest);
                }
                break;
            }
            self.bytes -= front.len();
        }
    }

    /// The whole history as one chunk, or `None` when it is empty.
    pub(crate) fn snapshot(&self) -> Option<Bytes> {
        match self.chunks.len() {
            0 => None,
            1 => self.chunks.front().cloned(),
            _ => {
                let mut joined = BytesMut::with_capacity(self.bytes);
                for chunk in &self.chunks {
                    joined.extend_from_slice(chunk);
                }
                Some(joined.freeze())
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len_bytes(&self) -> usize {
        self.bytes
    }
}

/// Drop leading UTF-8 continuation bytes so a cut never starts mid-character.
fn skip_continuation_bytes(chunk: Bytes) -> Bytes {
    let start = chunk
        .iter()
        .take(3)
        .take_while(|b| (**b & 0b1100_0000) == 0b1000_0000)
        .count();
    chunk.slice(start..)
}
