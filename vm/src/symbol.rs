use std::{collections::HashMap, fmt, sync::Arc, sync::LazyLock};

use parking_lot::RwLock;

/// An interned name: method ids, instance-variable ids, constant names and
/// symbol literals. Ids are process-wide, so every VM agrees on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(u32);

struct SymbolTableImpl {
    names: Vec<Arc<str>>,
    ids: HashMap<Arc<str>, Symbol>,
}

struct SymbolTable(RwLock<SymbolTableImpl>);

macro_rules! known_symbols {
    ($($name:ident = $text:literal,)*) => {
        #[allow(non_camel_case_types, clippy::upper_case_acronyms)]
        #[repr(u32)]
        enum Known {
            $($name,)*
        }

        /// Symbols the runtime refers to by name, interned before any other.
        pub mod sym {
            use super::{Known, Symbol};
            $(pub const $name: Symbol = Symbol(Known::$name as u32);)*
        }

        const KNOWN: &[&str] = &[$($text,)*];
    };
}

known_symbols! {
    INITIALIZE = "initialize",
    NEW = "new",
    CALL = "call",
    METHOD_MISSING = "method_missing",
    TO_S = "to_s",
    INSPECT = "inspect",
    EQ = "==",
    PLUS = "+",
    MINUS = "-",
    MUL = "*",
    DIV = "/",
    LT = "<",
    LE = "<=",
    GT = ">",
    GE = ">=",
    CMP = "<=>",
    EACH = "each",
    MESSAGE = "message",
}

static SYMBOLS: LazyLock<SymbolTable> = LazyLock::new(SymbolTable::new);

impl SymbolTableImpl {
    fn get_or_add(&mut self, name: &str) -> Symbol {
        if let Some(&sym) = self.ids.get(name) {
            return sym;
        }
        let sym = Symbol(self.names.len() as u32);
        let interned: Arc<str> = Arc::from(name);
        self.names.push(interned.clone());
        self.ids.insert(interned, sym);
        sym
    }
}

impl SymbolTable {
    fn new() -> Self {
        let mut table = SymbolTableImpl {
            names: Vec::with_capacity(256),
            ids: HashMap::with_capacity(256),
        };
        for name in KNOWN {
            table.get_or_add(name);
        }
        Self(RwLock::new(table))
    }
}

impl Symbol {
    /// Intern `name`, returning the existing id if it was seen before.
    pub fn intern(name: &str) -> Symbol {
        if let Some(&sym) = SYMBOLS.0.read().ids.get(name) {
            return sym;
        }
        SYMBOLS.0.write().get_or_add(name)
    }

    /// The id of `name` if it has been interned.
    pub fn lookup(name: &str) -> Option<Symbol> {
        SYMBOLS.0.read().ids.get(name).copied()
    }

    pub fn name(self) -> Arc<str> {
        // Symbols are only minted by the table, so the index is valid.
        SYMBOLS.0.read().names[self.0 as usize].clone()
    }

    pub fn id(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_stable() {
        let a = Symbol::intern("symbol_table_test_a");
        let b = Symbol::intern("symbol_table_test_b");
        assert_ne!(a, b);
        assert_eq!(Symbol::intern("symbol_table_test_a"), a);
        assert_eq!(&*a.name(), "symbol_table_test_a");
        assert_eq!(Symbol::lookup("symbol_table_test_b"), Some(b));
        assert_eq!(Symbol::lookup("symbol_table_never_interned"), None);
    }

    #[test]
    fn known_symbols_are_preinterned() {
        assert_eq!(sym::INITIALIZE.id(), 0);
        assert_eq!(Symbol::intern("initialize"), sym::INITIALIZE);
        assert_eq!(Symbol::intern("<=>"), sym::CMP);
        assert_eq!(sym::MESSAGE.to_string(), "message");
    }

    #[test]
    fn shared_across_threads() {
        let here = Symbol::intern("symbol_table_test_thread");
        let there = std::thread::spawn(|| Symbol::intern("symbol_table_test_thread"))
            .join()
            .expect("thread");
        assert_eq!(here, there);
    }
}
