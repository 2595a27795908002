//! Symbol map.
//!
//! Function ranges and labels keyed by guest address. The compiler asks it
//! for function sizes before inlining a replacement; tooling uses it to
//! name code addresses.
//!
//! Text maps use one symbol per line, `address size name`, with hex address
//! and size. Blank lines and lines starting with `#` are skipped.

use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSymbol {
    pub name: String,
    pub size: u32,
}

#[derive(Debug, Default, Clone)]
pub struct SymbolMap {
    functions: BTreeMap<u32, FunctionSymbol>,
    labels: BTreeMap<u32, String>,
}

impl SymbolMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a text map. Malformed lines are logged and skipped.
    pub fn parse(text: &str) -> Self {
        let mut map = Self::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.splitn(3, char::is_whitespace);
            let addr = parts.next().and_then(parse_hex);
            let size = parts.next().and_then(parse_hex);
            let name = parts.next().map(str::trim).filter(|n| !n.is_empty());
            match (addr, size, name) {
                (Some(addr), Some(size), Some(name)) => map.add_function(addr, size, name),
                _ => log::debug!("[JIT] symbol map line {} ignored: {:?}", lineno + 1, line),
            }
        }
        map
    }

    pub fn add_function(&mut self, addr: u32, size: u32, name: &str) {
        self.functions.insert(
            addr,
            FunctionSymbol {
                name: name.to_string(),
                size,
            },
        );
    }

    pub fn add_label(&mut self, addr: u32, name: &str) {
        self.labels.insert(addr, name.to_string());
    }

    pub fn remove(&mut self, addr: u32) {
        self.functions.remove(&addr);
        self.labels.remove(&addr);
    }

    pub fn clear(&mut self) {
        self.functions.clear();
        self.labels.clear();
    }

    pub fn len(&self) -> usize {
        self.functions.len() + self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty() && self.labels.is_empty()
    }

    /// Size of the function starting exactly at `addr`.
    pub fn function_size(&self, addr: u32) -> Option<u32> {
        self.functions.get(&addr).map(|f| f.size)
    }

    /// Function whose range contains `addr`, with its start.
    pub fn function_at(&self, addr: u32) -> Option<(u32, &FunctionSymbol)> {
        let (start, f) = self.functions.range(..=addr).next_back()?;
        let end = *start as u64 + f.size.max(1) as u64;
        if (addr as u64) < end {
            Some((*start, f))
        } else {
            None
        }
    }

    /// Exact name for `addr`: a label, else a function starting there.
    pub fn label(&self, addr: u32) -> Option<&str> {
        self.labels
            .get(&addr)
            .map(String::as_str)
            .or_else(|| self.functions.get(&addr).map(|f| f.name.as_str()))
    }

    /// `name` or `name+0xoff` for addresses inside a known function.
    pub fn description(&self, addr: u32) -> Option<String> {
        if let Some(label) = self.label(addr) {
            return Some(label.to_string());
        }
        self.function_at(addr)
            .map(|(start, f)| format!("{}+0x{:x}", f.name, addr - start))
    }
}

fn parse_hex(s: &str) -> Option<u32> {
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(s, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_lookup() {
        let mut map = SymbolMap::new();
        map.add_function(0x8001_0000, 0x40, "memcpy");
        assert_eq!(map.function_size(0x8001_0000), Some(0x40));
        assert_eq!(map.function_size(0x8001_0004), None);
        assert_eq!(map.function_at(0x8001_003C).map(|(a, _)| a), Some(0x8001_0000));
        assert!(map.function_at(0x8001_0040).is_none());
        assert!(map.function_at(0x8000_FFFC).is_none());
    }

    #[test]
    fn test_labels_and_description() {
        let mut map = SymbolMap::new();
        map.add_function(0x1000, 0x20, "main");
        map.add_label(0x1010, "loop");
        assert_eq!(map.label(0x1000), Some("main"));
        assert_eq!(map.label(0x1010), Some("loop"));
        assert_eq!(map.description(0x1008).as_deref(), Some("main+0x8"));
        assert_eq!(map.description(0x1010).as_deref(), Some("loop"));
        assert_eq!(map.description(0x2000), None);
    }

    #[test]
    fn test_parse_text_map() {
        let text = "# demo\n\
                    80010000 40 memcpy\n\
                    0x80010040 0x10 strlen helper\n\
                    bogus line\n\
                    \n";
        let map = SymbolMap::parse(text);
        assert_eq!(map.len(), 2);
        assert_eq!(map.function_size(0x8001_0040), Some(0x10));
        assert_eq!(map.label(0x8001_0040), Some("strlen helper"));
    }

    #[test]
    fn test_remove_and_clear() {
        let mut map = SymbolMap::new();
        map.add_function(0x1000, 4, "a");
        map.add_label(0x2000, "b");
        map.remove(0x1000);
        assert_eq!(map.len(), 1);
        map.clear();
        assert!(map.is_empty());
    }
}
