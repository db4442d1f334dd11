//! The chunked `ACSE` / `ACSe` container.
//!
//! A chunk is a four-character id, a little-endian length, and a
//! payload. Unknown chunks are skipped. Each recognised chunk has its
//! own reader that validates its own payload; chunks are processed in
//! dependency order, not file order.

use super::{acs0, decrypt_cstr, scan_cstr, Cursor, LoadCtx, STR_ITER_DEFAULT};
use crate::error::{Error, Result};
use crate::module::{ArrayImport, ArrayInit, Module, RegImport, WordInit};
use crate::script::{Function, Script, ScriptFlags, ScriptType};
use crate::string::{StringIdx, STR_NONE};
use crate::Word;

pub(super) fn read(
    module: &mut Module,
    bytes: &[u8],
    ctx: &mut LoadCtx,
    encrypted: bool,
) -> Result<Vec<Vec<u8>>> {
    let chunk_off = Cursor::at(bytes, 4).get_u32("chunk table offset")? as usize;
    read_chunks(module, bytes, ctx, chunk_off, encrypted, false)
}

struct Chunk<'a> {
    id: [u8; 4],
    data: &'a [u8],
}

fn chunk_err(id: [u8; 4], reason: &'static str) -> Error {
    Error::BadChunk { id: String::from_utf8_lossy(&id).into_owned(), reason }
}

pub(super) fn read_chunks(
    module: &mut Module,
    bytes: &[u8],
    ctx: &mut LoadCtx,
    chunk_off: usize,
    encrypted: bool,
    fake_acs0: bool,
) -> Result<Vec<Vec<u8>>> {
    if chunk_off > bytes.len() {
        return Err(Error::Truncated("chunk table offset out of range"));
    }

    let mut chunks: Vec<Chunk> = Vec::new();
    let mut pos = chunk_off;
    while pos + 8 <= bytes.len() {
        let id: [u8; 4] = bytes[pos..pos + 4].try_into().unwrap();
        let len = Cursor::at(bytes, pos + 4).get_u32("chunk length")? as usize;
        let start = pos + 8;
        if start + len > bytes.len() {
            return Err(chunk_err(id, "length runs past end of file"));
        }
        chunks.push(Chunk { id, data: &bytes[start..start + len] });
        pos = start + len;
    }

    let imports = {
        let mut loader = Chunker {
            module: &mut *module,
            ctx: &mut *ctx,
            encrypted,
            fake_acs0,
            imports: Vec::new(),
        };
        loader.process(&chunks)?;
        loader.imports
    };

    acs0::finish(module, bytes, ctx);
    Ok(imports)
}

struct Chunker<'m, 'c> {
    module: &'m mut Module,
    ctx: &'m mut LoadCtx<'c>,
    encrypted: bool,
    fake_acs0: bool,
    imports: Vec<Vec<u8>>,
}

impl<'m, 'c> Chunker<'m, 'c> {
    fn process(&mut self, chunks: &[Chunk<'_>]) -> Result<()> {
        // String tables first (everything else names through them), then
        // declarations, then the tables that reference them.
        const ORDER: &[&[u8; 4]] = &[
            b"STRL", b"STRE", b"SNAM", b"FNAM", b"MEXP", b"ARAY", b"AIMP", b"MIMP", b"MINI",
            b"AINI", b"MSTR", b"ASTR", b"ATAG", b"FUNC", b"FARY", b"SPTR", b"SFLG", b"SVCT",
            b"SARY", b"JUMP", b"LOAD",
        ];
        for want in ORDER {
            for chunk in chunks.iter().filter(|c| &c.id == *want) {
                self.dispatch(chunk)?;
            }
        }
        for chunk in chunks {
            if !ORDER.iter().any(|w| *w == &chunk.id) {
                log::debug!(
                    "skipping unknown chunk {:?} ({} bytes)",
                    String::from_utf8_lossy(&chunk.id),
                    chunk.data.len()
                );
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, chunk: &Chunk<'_>) -> Result<()> {
        let d = chunk.data;
        match &chunk.id {
            b"STRL" => self.str_tab(chunk.id, d, true, self.encrypted).map(|v| {
                self.module.strings = v;
            }),
            b"STRE" => self.str_tab(chunk.id, d, true, true).map(|v| {
                self.module.strings = v;
            }),
            b"SNAM" => self.str_tab(chunk.id, d, false, false).map(|v| {
                self.module.scr_names = v;
            }),
            b"FNAM" => self.str_tab(chunk.id, d, false, false).map(|v| {
                self.module.func_names = v;
            }),
            b"MEXP" => self.str_tab(chunk.id, d, false, false).map(|v| {
                self.module.reg_names = v;
            }),
            b"ARAY" => self.aray(chunk.id, d),
            b"AIMP" => self.aimp(chunk.id, d),
            b"MIMP" => self.mimp(d),
            b"MINI" => self.mini(chunk.id, d),
            b"AINI" => self.aini(chunk.id, d),
            b"MSTR" => self.word_list(d).map(|v| {
                self.module.str_regs = v;
            }),
            b"ASTR" => self.word_list(d).map(|v| {
                self.module.str_arrs = v;
            }),
            b"ATAG" => self.atag(chunk.id, d),
            b"FUNC" => self.func(chunk.id, d),
            b"FARY" => self.fary(chunk.id, d),
            b"SPTR" => self.sptr(chunk.id, d),
            b"SFLG" => self.sflg(chunk.id, d),
            b"SVCT" => self.svct(chunk.id, d),
            b"SARY" => self.sary(chunk.id, d),
            b"JUMP" => self.jump(d),
            b"LOAD" => self.load(d),
            _ => Ok(()),
        }
    }

    /// Common string-table shape: optional pad word, count, optional pad
    /// word, chunk-relative offsets, then the string bytes.
    fn str_tab(
        &mut self,
        id: [u8; 4],
        d: &[u8],
        junk: bool,
        encrypted: bool,
    ) -> Result<Vec<StringIdx>> {
        let mut cur = Cursor::new(d);
        if junk {
            cur.skip(4);
        }
        let count = cur.get_u32("string count").map_err(|_| chunk_err(id, "missing count"))? as usize;
        if junk {
            cur.skip(4);
        }
        if cur.remaining() / 4 < count {
            return Err(chunk_err(id, "offset table truncated"));
        }
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let off = cur.get_u32("string offset")? as usize;
            if off > d.len() {
                return Err(chunk_err(id, "string offset out of range"));
            }
            let content = if encrypted {
                decrypt_cstr(d, off, STR_ITER_DEFAULT)
            } else {
                scan_cstr(d, off).to_vec()
            };
            out.push(self.ctx.strings.intern(&content));
        }
        Ok(out)
    }

    fn word_list(&mut self, d: &[u8]) -> Result<Vec<Word>> {
        let mut cur = Cursor::new(d);
        let mut out = Vec::with_capacity(d.len() / 4);
        while cur.remaining() >= 4 {
            out.push(cur.get_u32("word")?);
        }
        Ok(out)
    }

    fn aray(&mut self, id: [u8; 4], d: &[u8]) -> Result<()> {
        if d.len() % 8 != 0 {
            return Err(chunk_err(id, "expected 8-byte records"));
        }
        let mut cur = Cursor::new(d);
        while cur.remaining() >= 8 {
            let idx = cur.get_u32("array index")? as usize;
            let size = cur.get_u32("array size")?;
            if idx >= self.module.arr_sizes.len() {
                self.module.arr_sizes.resize(idx + 1, 0);
            }
            self.module.arr_sizes[idx] = size;
        }
        Ok(())
    }

    fn aimp(&mut self, id: [u8; 4], d: &[u8]) -> Result<()> {
        let mut cur = Cursor::new(d);
        let count = cur.get_u32("import count").map_err(|_| chunk_err(id, "missing count"))?;
        for _ in 0..count {
            let idx = cur.get_u32("array index").map_err(|_| chunk_err(id, "record truncated"))?;
            let size = cur.get_u32("array size").map_err(|_| chunk_err(id, "record truncated"))?;
            let name = cur.get_cstr().to_vec();
            if name.is_empty() {
                return Err(chunk_err(id, "empty import name"));
            }
            let name = self.ctx.strings.intern(&name);
            if idx as usize >= self.module.arr_sizes.len() {
                self.module.arr_sizes.resize(idx as usize + 1, 0);
            }
            self.module.arr_imports.push(ArrayImport { idx, size, name });
        }
        Ok(())
    }

    fn mimp(&mut self, d: &[u8]) -> Result<()> {
        let mut cur = Cursor::new(d);
        while cur.remaining() >= 5 {
            let idx = cur.get_u32("register index")?;
            let name = cur.get_cstr().to_vec();
            if name.is_empty() {
                continue;
            }
            let name = self.ctx.strings.intern(&name);
            self.module.reg_imports.push(RegImport { idx, name });
        }
        Ok(())
    }

    fn mini(&mut self, id: [u8; 4], d: &[u8]) -> Result<()> {
        if d.len() < 4 || d.len() % 4 != 0 {
            return Err(chunk_err(id, "expected index plus words"));
        }
        let mut cur = Cursor::new(d);
        let first = cur.get_u32("first register")?;
        let mut vals = Vec::new();
        while cur.remaining() >= 4 {
            vals.push(cur.get_u32("value")?);
        }
        self.module.reg_inits.push(WordInit { first, vals });
        Ok(())
    }

    fn aini(&mut self, id: [u8; 4], d: &[u8]) -> Result<()> {
        if d.len() < 4 || d.len() % 4 != 0 {
            return Err(chunk_err(id, "expected index plus words"));
        }
        let mut cur = Cursor::new(d);
        let arr = cur.get_u32("array index")?;
        let mut vals = Vec::new();
        while cur.remaining() >= 4 {
            vals.push(cur.get_u32("value")?);
        }
        self.module.arr_inits.push(ArrayInit { arr, vals });
        Ok(())
    }

    fn atag(&mut self, id: [u8; 4], d: &[u8]) -> Result<()> {
        let mut cur = Cursor::new(d);
        let version = cur.get_u8("version").map_err(|_| chunk_err(id, "missing version"))?;
        if version != 0 {
            log::warn!("ATAG version {version} not understood, skipping");
            return Ok(());
        }
        let arr = cur.get_u32("array index").map_err(|_| chunk_err(id, "missing array index"))?;
        let tags = d[cur.pos()..].to_vec();
        self.module.arr_tags.push((arr, tags));
        Ok(())
    }

    fn func(&mut self, id: [u8; 4], d: &[u8]) -> Result<()> {
        if d.len() % 8 != 0 {
            return Err(chunk_err(id, "expected 8-byte records"));
        }
        let mut cur = Cursor::new(d);
        while cur.remaining() >= 8 {
            let argc = cur.get_u8("argc")? as u32;
            let locals = cur.get_u8("local count")? as u32;
            let has_return = cur.get_u8("has-return flag")? != 0;
            cur.skip(1);
            let offset = cur.get_u32("code offset")?;
            self.module.functions.push(Function {
                argc,
                loc_reg_count: argc + locals,
                loc_arr_count: 0,
                has_return,
                code_idx: offset,
                module: 0,
            });
        }
        Ok(())
    }

    fn fary(&mut self, id: [u8; 4], d: &[u8]) -> Result<()> {
        if d.len() % 4 != 0 {
            return Err(chunk_err(id, "expected 4-byte records"));
        }
        let mut cur = Cursor::new(d);
        while cur.remaining() >= 4 {
            let idx = cur.get_u16("function index")? as usize;
            let count = cur.get_u16("array count")? as u32;
            if let Some(f) = self.module.functions.get_mut(idx) {
                f.loc_arr_count = count;
            } else {
                log::warn!("FARY names function {idx} which does not exist");
            }
        }
        Ok(())
    }

    /// Script pointers. Two record widths exist; the width is inferred
    /// from the chunk length, biased by whether the container wears a
    /// fake ACS0 stub (the old toolchain emitted 8-byte records).
    fn sptr(&mut self, id: [u8; 4], d: &[u8]) -> Result<()> {
        let twelve = d.len() % 12 == 0;
        let eight = d.len() % 8 == 0;
        let wide = match (twelve, eight) {
            (true, true) => !self.fake_acs0,
            (true, false) => true,
            (false, true) => false,
            (false, false) => return Err(chunk_err(id, "length fits neither record width")),
        };
        let mut cur = Cursor::new(d);
        while cur.remaining() >= if wide { 12 } else { 8 } {
            let (raw_id, stype, argc, offset) = if wide {
                let raw_id = cur.get_i16("script id")?;
                let stype = cur.get_u16("script type")? as Word;
                let offset = cur.get_u32("script offset")?;
                let argc = cur.get_u32("script argc")?;
                (raw_id, stype, argc, offset)
            } else {
                let raw_id = cur.get_i16("script id")?;
                let stype = cur.get_u8("script type")? as Word;
                let argc = cur.get_u8("script argc")? as u32;
                let offset = cur.get_u32("script offset")?;
                (raw_id, stype, argc, offset)
            };
            let (number, name) = self.script_name(raw_id);
            self.module.scripts.push(Script {
                number,
                name,
                stype: ScriptType::from_word(stype),
                flags: ScriptFlags::empty(),
                argc,
                loc_reg_count: self.ctx.script_locals_default.max(argc),
                loc_arr_count: 0,
                code_idx: offset,
                module: 0,
            });
        }
        Ok(())
    }

    /// A negative raw id is a named script: its bit-inverse indexes the
    /// SNAM table. The raw value stays as the matching key either way.
    fn script_name(&self, raw_id: i16) -> (Word, Option<StringIdx>) {
        let number = raw_id as i32 as Word;
        if raw_id < 0 {
            let idx = !raw_id as usize;
            let name = self.module.scr_names.get(idx).copied().unwrap_or(STR_NONE);
            (number, Some(name))
        } else {
            (number, None)
        }
    }

    fn sflg(&mut self, id: [u8; 4], d: &[u8]) -> Result<()> {
        if d.len() % 4 != 0 {
            return Err(chunk_err(id, "expected 4-byte records"));
        }
        let mut cur = Cursor::new(d);
        while cur.remaining() >= 4 {
            let raw_id = cur.get_i16("script id")? as i32 as Word;
            let flags = ScriptFlags::from_bits_truncate(cur.get_u16("flags")?);
            for scr in self.module.scripts.iter_mut().filter(|s| s.number == raw_id) {
                scr.flags = flags;
            }
        }
        Ok(())
    }

    fn svct(&mut self, id: [u8; 4], d: &[u8]) -> Result<()> {
        if d.len() % 4 != 0 {
            return Err(chunk_err(id, "expected 4-byte records"));
        }
        let mut cur = Cursor::new(d);
        while cur.remaining() >= 4 {
            let raw_id = cur.get_i16("script id")? as i32 as Word;
            let count = cur.get_u16("register count")? as u32;
            for scr in self.module.scripts.iter_mut().filter(|s| s.number == raw_id) {
                scr.loc_reg_count = count.max(scr.argc);
            }
        }
        Ok(())
    }

    fn sary(&mut self, id: [u8; 4], d: &[u8]) -> Result<()> {
        if d.len() % 4 != 0 {
            return Err(chunk_err(id, "expected 4-byte records"));
        }
        let mut cur = Cursor::new(d);
        while cur.remaining() >= 4 {
            let raw_id = cur.get_i16("script id")? as i32 as Word;
            let count = cur.get_u16("array count")? as u32;
            for scr in self.module.scripts.iter_mut().filter(|s| s.number == raw_id) {
                scr.loc_arr_count = count;
            }
        }
        Ok(())
    }

    fn jump(&mut self, d: &[u8]) -> Result<()> {
        let mut cur = Cursor::new(d);
        while cur.remaining() >= 4 {
            self.module.jumps.push(cur.get_u32("jump target")?);
        }
        Ok(())
    }

    fn load(&mut self, d: &[u8]) -> Result<()> {
        let mut cur = Cursor::new(d);
        while cur.remaining() > 0 {
            let name = cur.get_cstr();
            if !name.is_empty() {
                self.imports.push(name.to_vec());
            }
        }
        Ok(())
    }
}
