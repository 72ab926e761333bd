//! String pool builder for map snapshots.
//!
//! Map builders accumulate entry text here while walking kernel structures;
//! identical strings are stored once. The finished pool is immutable and
//! entries refer into it with [`TextRef`] offsets, which keeps snapshots
//! free of per-entry allocations and cycles.

use fnv::FnvHashMap;

/// Offset/length reference into a finalized string pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TextRef {
    pub off: u32,
    pub len: u32,
}

impl TextRef {
    pub fn get<'a>(&self, pool: &'a str) -> &'a str {
        let off = self.off as usize;
        let end = off + self.len as usize;
        pool.get(off..end).unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Default)]
pub struct ObStrMap {
    buf: String,
    dedup: FnvHashMap<String, TextRef>,
}

impl ObStrMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a string, returning its pool reference.
    pub fn push(&mut self, s: &str) -> TextRef {
        if s.is_empty() {
            return TextRef::default();
        }
        if let Some(r) = self.dedup.get(s) {
            return *r;
        }
        let r = TextRef { off: self.buf.len() as u32, len: s.len() as u32 };
        self.buf.push_str(s);
        self.dedup.insert(s.to_string(), r);
        r
    }

    /// Consume the builder, producing the immutable pool.
    pub fn finalize(self) -> String {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_and_dedup() {
        let mut sm = ObStrMap::new();
        let a = sm.push("ntdll.dll");
        let b = sm.push("kernel32.dll");
        let a2 = sm.push("ntdll.dll");
        assert_eq!(a, a2);
        assert_ne!(a, b);
        let pool = sm.finalize();
        assert_eq!(a.get(&pool), "ntdll.dll");
        assert_eq!(b.get(&pool), "kernel32.dll");
        assert_eq!(pool.len(), "ntdll.dll".len() + "kernel32.dll".len());
    }

    #[test]
    fn empty_ref() {
        let mut sm = ObStrMap::new();
        let e = sm.push("");
        assert!(e.is_empty());
        assert_eq!(e.get(&sm.finalize()), "");
    }
}
