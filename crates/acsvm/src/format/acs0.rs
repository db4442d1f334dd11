//! The linear `ACS\0` container: header, code segment, then a script
//! directory and a string-offset table at the tail.

use super::translate::Translator;
use super::{acse, scan_cstr, Cursor, LoadCtx, MAGIC_ACSE, MAGIC_ACSE_ENC};
use crate::error::{Error, Result};
use crate::module::Module;
use crate::script::{Script, ScriptFlags, ScriptType};
use crate::Word;

pub(super) fn read(
    module: &mut Module,
    bytes: &[u8],
    ctx: &mut LoadCtx,
) -> Result<Vec<Vec<u8>>> {
    let dir_ptr = Cursor::at(bytes, 4).get_u32("directory pointer")? as usize;
    if dir_ptr < 8 || dir_ptr >= bytes.len() {
        return Err(Error::Truncated("script directory out of range"));
    }

    // Chunked modules sometimes wear a fake ACS0 stub for backward
    // compatibility: a chunk-format marker sits just before the
    // directory, with the real chunk-table offset ahead of it.
    if dir_ptr >= 12 {
        let marker: [u8; 4] = bytes[dir_ptr - 4..dir_ptr].try_into().unwrap();
        if marker == MAGIC_ACSE || marker == MAGIC_ACSE_ENC {
            let chunk_off = Cursor::at(bytes, dir_ptr - 8).get_u32("chunk table offset")? as usize;
            let encrypted = marker == MAGIC_ACSE_ENC;
            return acse::read_chunks(module, bytes, ctx, chunk_off, encrypted, true);
        }
    }

    let mut dir = Cursor::at(bytes, dir_ptr);
    let script_count = dir.get_u32("script count")? as usize;
    if dir.remaining() / 12 < script_count {
        return Err(Error::Truncated("script directory"));
    }
    for _ in 0..script_count {
        let raw_id = dir.get_u32("script id")?;
        let offset = dir.get_u32("script offset")?;
        let argc = dir.get_u32("script argc")?;
        // Old-style directories encode the type in the thousands digit.
        let stype = ScriptType::from_word(raw_id / 1000);
        module.scripts.push(Script {
            number: raw_id % 1000,
            name: None,
            stype,
            flags: ScriptFlags::empty(),
            argc,
            loc_reg_count: ctx.script_locals_default.max(argc),
            loc_arr_count: 0,
            code_idx: offset,
            module: 0,
        });
    }

    let string_count = dir.get_u32("string count")? as usize;
    if dir.remaining() / 4 < string_count {
        return Err(Error::Truncated("string offsets"));
    }
    for _ in 0..string_count {
        let off = dir.get_u32("string offset")? as usize;
        let content = scan_cstr(bytes, off).to_vec();
        module.strings.push(ctx.strings.intern(&content));
    }

    finish(module, bytes, ctx);
    Ok(Vec::new())
}

/// Translate the code segment and remap every recorded byte offset,
/// shared with the chunked reader.
pub(super) fn finish(module: &mut Module, bytes: &[u8], ctx: &mut LoadCtx) {
    let mut entries: Vec<u32> = Vec::new();
    entries.extend(module.scripts.iter().map(|s| s.code_idx));
    entries.extend(module.functions.iter().map(|f| f.code_idx));
    entries.extend(module.jumps.iter().copied());

    let t = Translator::new(bytes, ctx.code_table, ctx.func_data).run(&entries);
    for scr in module.scripts.iter_mut() {
        scr.code_idx = t.resolve(scr.code_idx);
    }
    for f in module.functions.iter_mut() {
        f.code_idx = if f.code_idx == 0 { 0 } else { t.resolve(f.code_idx) };
    }
    for j in module.jumps.iter_mut() {
        *j = t.resolve(*j);
    }
    module.code = t.code;
    module.jump_maps = t.jump_maps;

    // Register space: big enough for everything initializers, imports
    // and exports mention, with the classic floor.
    let mut regs = super::MOD_REG_FLOOR;
    for init in &module.reg_inits {
        regs = regs.max(init.first + init.vals.len() as Word);
    }
    for imp in &module.reg_imports {
        regs = regs.max(imp.idx + 1);
    }
    regs = regs.max(module.reg_names.len() as Word);
    module.reg_count = regs;

    module.arr_names.resize(module.arr_sizes.len(), crate::string::STR_NONE);
    for (i, name) in module.reg_names.iter().enumerate() {
        if i < module.arr_sizes.len() && module.arr_sizes[i] > 0 {
            module.arr_names[i] = *name;
        }
    }

    module.ref_strings(ctx.strings);
    module.loaded = true;
}
