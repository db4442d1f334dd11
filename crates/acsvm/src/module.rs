use std::collections::BTreeMap;

use crate::script::{Function, Script};
use crate::string::{StringIdx, StringTable};
use crate::Word;

pub type ModuleId = usize;

/// Identity of a module. Two names designate the same bytecode iff all
/// three components are equal; the name is the key under which the
/// environment memoises loaded modules.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ModuleName {
    /// Usually the textual reference the host resolved (a path, a lump
    /// name, ...). May be absent for purely host-identified modules.
    pub text: Option<Box<[u8]>>,
    /// Opaque host pointer value; only compared, never dereferenced.
    pub ptr: usize,
    /// Arbitrary host tag.
    pub tag: usize,
}

impl ModuleName {
    pub fn text(text: &[u8]) -> Self {
        ModuleName { text: Some(text.into()), ptr: 0, tag: 0 }
    }

    pub fn text_lossy(&self) -> String {
        match &self.text {
            Some(t) => String::from_utf8_lossy(t).into_owned(),
            None => format!("<module {:#x}:{}>", self.ptr, self.tag),
        }
    }
}

/// Scalar initializer: consecutive register values starting at `first`.
#[derive(Clone, Debug, Default)]
pub struct WordInit {
    pub first: Word,
    pub vals: Vec<Word>,
}

/// Array initializer: element values of array `arr`, from element 0.
#[derive(Clone, Debug, Default)]
pub struct ArrayInit {
    pub arr: Word,
    pub vals: Vec<Word>,
}

/// Array import request: the named array must be exported by another
/// module registered into the same map.
#[derive(Clone, Debug)]
pub struct ArrayImport {
    pub idx: Word,
    pub size: Word,
    pub name: StringIdx,
}

/// Register import request.
#[derive(Clone, Debug)]
pub struct RegImport {
    pub idx: Word,
    pub name: StringIdx,
}

/// A compiled ACS module: translated code plus every static table the
/// loader recovered from the container. A module with `loaded == false`
/// is a stub: its name is known, its body has not been read yet.
#[derive(Debug, Default)]
pub struct Module {
    pub name: Option<ModuleName>,
    pub loaded: bool,

    /// Translated code: `Code` discriminants with inline immediates.
    /// Index 0 is a reserved `Kill` instruction.
    pub code: Vec<Word>,
    /// Declared indirect-branch targets (JUMP), as code indices.
    pub jumps: Vec<Word>,
    /// Case tables collapsed from case-goto runs: value -> code index.
    pub jump_maps: Vec<BTreeMap<Word, Word>>,

    pub arr_sizes: Vec<Word>,
    pub arr_names: Vec<StringIdx>,
    pub arr_inits: Vec<ArrayInit>,
    pub arr_imports: Vec<ArrayImport>,
    /// Arrays whose initializer values are module-local string indices.
    pub str_arrs: Vec<Word>,
    /// Per-element string tags: (array, tag bytes; 1 = string).
    pub arr_tags: Vec<(Word, Vec<u8>)>,

    pub reg_count: Word,
    pub reg_names: Vec<StringIdx>,
    pub reg_inits: Vec<WordInit>,
    pub reg_imports: Vec<RegImport>,
    /// Registers whose initializer values are module-local string indices.
    pub str_regs: Vec<Word>,

    pub func_names: Vec<StringIdx>,
    pub functions: Vec<Function>,

    pub scr_names: Vec<StringIdx>,
    pub scripts: Vec<Script>,

    /// Local string table: local index -> environment string.
    pub strings: Vec<StringIdx>,

    pub imports: Vec<ModuleId>,

    /// Whether this module currently holds references in the string
    /// table for its string slots.
    pub(crate) strings_reffed: bool,
}

impl Module {
    pub fn new(name: ModuleName) -> Self {
        Module { name: Some(name), ..Module::default() }
    }

    /// Resolve a module-local string index to an environment index.
    pub fn string(&self, local: Word) -> Option<StringIdx> {
        self.strings.get(local as usize).copied()
    }

    pub fn visit_strings(&self, mut f: impl FnMut(StringIdx)) {
        for &s in self
            .strings
            .iter()
            .chain(self.arr_names.iter())
            .chain(self.reg_names.iter())
            .chain(self.func_names.iter())
            .chain(self.scr_names.iter())
        {
            f(s);
        }
        for imp in &self.arr_imports {
            f(imp.name);
        }
        for imp in &self.reg_imports {
            f(imp.name);
        }
    }

    /// Add one table reference per string slot. Idempotent per load.
    pub fn ref_strings(&mut self, table: &mut StringTable) {
        if self.strings_reffed {
            return;
        }
        let mut refs = Vec::new();
        self.visit_strings(|s| refs.push(s));
        for s in refs {
            table.add_ref(s);
        }
        self.strings_reffed = true;
    }

    pub fn unref_strings(&mut self, table: &mut StringTable) {
        if !self.strings_reffed {
            return;
        }
        let mut refs = Vec::new();
        self.visit_strings(|s| refs.push(s));
        for s in refs {
            table.drop_ref(s);
        }
        self.strings_reffed = false;
    }

    /// Re-resolve every string slot against the current table and take
    /// references again. Used after state deserialization replaced the
    /// table wholesale.
    pub fn reset_strings(&mut self, table: &mut StringTable) {
        fn remap(slot: &mut StringIdx, table: &mut StringTable) {
            let content = table.bytes(*slot).to_vec();
            *slot = table.intern(&content);
        }
        for s in self
            .strings
            .iter_mut()
            .chain(self.arr_names.iter_mut())
            .chain(self.reg_names.iter_mut())
            .chain(self.func_names.iter_mut())
            .chain(self.scr_names.iter_mut())
        {
            remap(s, table);
        }
        for imp in self.arr_imports.iter_mut() {
            remap(&mut imp.name, table);
        }
        for imp in self.reg_imports.iter_mut() {
            remap(&mut imp.name, table);
        }
        for scr in self.scripts.iter_mut() {
            if let Some(n) = scr.name.as_mut() {
                remap(n, table);
            }
        }
        self.strings_reffed = false;
        self.ref_strings(table);
    }

    /// Drop everything read from bytecode, releasing string references.
    /// The name and identity survive; `loaded` returns to false.
    pub fn reset(&mut self, table: &mut StringTable) {
        self.unref_strings(table);
        let name = self.name.take();
        *self = Module::default();
        self.name = name;
    }
}
