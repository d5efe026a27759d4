//! Secure credential buffer.
//!
//! Holds the in-progress password as UTF-8. The buffer is erased (every
//! byte of the allocation overwritten with zero) on every clear and on
//! drop; capacity is kept so a clear never returns memory to the
//! allocator with credential bytes still in it.

use zeroize::Zeroize;

/// Initial capacity, chosen so typical passwords never reallocate.
/// A reallocation would copy the bytes and leave the old allocation
/// for the allocator to hand out unzeroed.
const INITIAL_CAPACITY: usize = 256;

/// Growable byte buffer for the in-progress credential.
#[derive(Default)]
pub struct Password {
    buf: Vec<u8>,
}

impl Password {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(INITIAL_CAPACITY),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    pub fn as_str(&self) -> &str {
        // Only `push` appends, and it appends whole codepoints.
        std::str::from_utf8(&self.buf).unwrap_or("")
    }

    /// Append one codepoint. Growth is geometric (Vec). If the allocator
    /// refuses, the keystroke is dropped and the buffer stays consistent;
    /// `try_reserve` never leaves a partially written codepoint behind.
    pub fn push(&mut self, ch: char) -> bool {
        let mut utf8 = [0u8; 4];
        let encoded = ch.encode_utf8(&mut utf8);
        if self.buf.try_reserve(encoded.len()).is_err() {
            utf8.zeroize();
            return false;
        }
        self.buf.extend_from_slice(encoded.as_bytes());
        utf8.zeroize();
        true
    }

    /// Remove the last codepoint. Returns false (and mutates nothing) on an
    /// empty buffer.
    pub fn pop(&mut self) -> bool {
        let s = match std::str::from_utf8(&self.buf) {
            Ok(s) => s,
            Err(_) => return false,
        };
        let Some(ch) = s.chars().next_back() else {
            return false;
        };
        let new_len = self.buf.len() - ch.len_utf8();
        for b in &mut self.buf[new_len..] {
            *b = 0;
        }
        self.buf.truncate(new_len);
        true
    }

    /// Erase the buffer: every byte of the allocation, including spare
    /// capacity, is overwritten with zero and the length reset. Idempotent,
    /// and safe to call from a timer while key processing is in flight on
    /// the same (single) thread.
    pub fn clear(&mut self) {
        self.buf.zeroize();
    }
}

impl Drop for Password {
    fn drop(&mut self) {
        self.clear();
    }
}

impl std::fmt::Debug for Password {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print credential bytes.
        write!(f, "Password(len={})", self.buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocation_bytes(pw: &Password) -> Vec<u8> {
        // Inspect the full allocation, spare capacity included.
        let ptr = pw.buf.as_ptr();
        let cap = pw.buf.capacity();
        unsafe { std::slice::from_raw_parts(ptr, cap) }.to_vec()
    }

    #[test]
    fn test_len_never_exceeds_capacity() {
        let mut pw = Password::new();
        for i in 0..1000 {
            pw.push(char::from_u32('a' as u32 + (i % 26)).unwrap());
            assert!(pw.len() <= pw.capacity());
        }
        for _ in 0..500 {
            pw.pop();
            assert!(pw.len() <= pw.capacity());
        }
    }

    #[test]
    fn test_clear_zeroes_full_capacity() {
        let mut pw = Password::new();
        for ch in "hunter2hunter2".chars() {
            assert!(pw.push(ch));
        }
        let cap = pw.capacity();
        pw.clear();
        assert_eq!(pw.len(), 0);
        assert_eq!(pw.capacity(), cap, "clear must not release capacity");
        assert!(allocation_bytes(&pw).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_clear_is_idempotent() {
        let mut pw = Password::new();
        pw.push('x');
        pw.clear();
        pw.clear();
        assert!(pw.is_empty());
        assert!(allocation_bytes(&pw).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_pop_on_empty_is_reported_noop() {
        let mut pw = Password::new();
        assert!(!pw.pop());
        assert_eq!(pw.len(), 0);
    }

    #[test]
    fn test_pop_removes_whole_codepoint() {
        let mut pw = Password::new();
        pw.push('a');
        pw.push('ß');
        pw.push('語');
        assert!(pw.pop());
        assert_eq!(pw.as_str(), "aß");
        assert!(pw.pop());
        assert_eq!(pw.as_str(), "a");
    }

    #[test]
    fn test_popped_bytes_are_zeroed_in_place() {
        let mut pw = Password::new();
        pw.push('a');
        pw.push('b');
        pw.pop();
        let bytes = allocation_bytes(&pw);
        assert_eq!(bytes[0], b'a');
        assert_eq!(bytes[1], 0);
    }
}
