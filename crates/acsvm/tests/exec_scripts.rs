//! End-to-end scenarios: tiny module images are assembled in memory,
//! loaded through the normal host path, and driven tick by tick.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use acsvm::{CodeData, Environment, ScopePath, ScriptType, ThreadState, Word};

// ---- image builders ---------------------------------------------------

/// Linear ACS0 image: header, code words, script directory, strings.
/// Script offsets are word indices into `code`.
fn acs0(code: &[u32], scripts: &[(u32, usize, u32)], strings: &[&[u8]]) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"ACS\0");
    bytes.extend_from_slice(&0u32.to_le_bytes());
    for w in code {
        bytes.extend_from_slice(&w.to_le_bytes());
    }
    let dir_ptr = bytes.len() as u32;
    bytes[4..8].copy_from_slice(&dir_ptr.to_le_bytes());

    bytes.extend_from_slice(&(scripts.len() as u32).to_le_bytes());
    for &(id, word_off, argc) in scripts {
        bytes.extend_from_slice(&id.to_le_bytes());
        bytes.extend_from_slice(&((8 + 4 * word_off) as u32).to_le_bytes());
        bytes.extend_from_slice(&argc.to_le_bytes());
    }
    bytes.extend_from_slice(&(strings.len() as u32).to_le_bytes());
    let offsets_at = bytes.len();
    for _ in strings {
        bytes.extend_from_slice(&0u32.to_le_bytes());
    }
    for (i, s) in strings.iter().enumerate() {
        let here = bytes.len() as u32;
        bytes[offsets_at + 4 * i..offsets_at + 4 * i + 4].copy_from_slice(&here.to_le_bytes());
        bytes.extend_from_slice(s);
        bytes.push(0);
    }
    bytes
}

/// Chunked image: code body right after the header, chunk table at the
/// tail.
struct Acse {
    magic: [u8; 4],
    body: Vec<u8>,
    chunks: Vec<([u8; 4], Vec<u8>)>,
}

impl Acse {
    fn new() -> Self {
        Acse { magic: *b"ACSE", body: Vec::new(), chunks: Vec::new() }
    }

    fn encrypted() -> Self {
        Acse { magic: *b"ACSe", body: Vec::new(), chunks: Vec::new() }
    }

    /// Append code words to the body, returning their byte offset in the
    /// final image.
    fn code(&mut self, words: &[u32]) -> u32 {
        let off = 8 + self.body.len() as u32;
        for w in words {
            self.body.extend_from_slice(&w.to_le_bytes());
        }
        off
    }

    fn chunk(&mut self, id: &[u8; 4], data: Vec<u8>) -> &mut Self {
        self.chunks.push((*id, data));
        self
    }

    /// 12-byte SPTR records: (id, type, byte offset, argc).
    fn sptr(&mut self, scripts: &[(i16, u16, u32, u32)]) -> &mut Self {
        let mut d = Vec::new();
        for &(id, ty, off, argc) in scripts {
            d.extend_from_slice(&id.to_le_bytes());
            d.extend_from_slice(&ty.to_le_bytes());
            d.extend_from_slice(&off.to_le_bytes());
            d.extend_from_slice(&argc.to_le_bytes());
        }
        self.chunk(b"SPTR", d)
    }

    fn build(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&self.magic);
        bytes.extend_from_slice(&((8 + self.body.len()) as u32).to_le_bytes());
        bytes.extend_from_slice(&self.body);
        for (id, data) in &self.chunks {
            bytes.extend_from_slice(id);
            bytes.extend_from_slice(&(data.len() as u32).to_le_bytes());
            bytes.extend_from_slice(data);
        }
        bytes
    }
}

/// SNAM/FNAM/MEXP-shaped string table: count, offsets, strings.
fn name_table(names: &[&[u8]]) -> Vec<u8> {
    let mut d = Vec::new();
    d.extend_from_slice(&(names.len() as u32).to_le_bytes());
    let offsets_at = d.len();
    for _ in names {
        d.extend_from_slice(&0u32.to_le_bytes());
    }
    for (i, n) in names.iter().enumerate() {
        let here = d.len() as u32;
        d[offsets_at + 4 * i..offsets_at + 4 * i + 4].copy_from_slice(&here.to_le_bytes());
        d.extend_from_slice(n);
        d.push(0);
    }
    d
}

/// MIMP records: (register index, name).
fn mimp(entries: &[(u32, &[u8])]) -> Vec<u8> {
    let mut d = Vec::new();
    for &(idx, name) in entries {
        d.extend_from_slice(&idx.to_le_bytes());
        d.extend_from_slice(name);
        d.push(0);
    }
    d
}

// ---- host scaffolding -------------------------------------------------

fn env_with(modules: HashMap<&'static str, Vec<u8>>) -> Environment {
    let mut env = Environment::new();
    let modules: HashMap<Vec<u8>, Vec<u8>> =
        modules.into_iter().map(|(k, v)| (k.as_bytes().to_vec(), v)).collect();
    env.set_module_loader(Rc::new(move |name| {
        let key = name.text.as_deref().unwrap_or(b"");
        modules
            .get(key)
            .cloned()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no such module"))
    }));
    env
}

/// Bind opcode 86 to an EndPrint that collects flushed lines.
fn capture_print(env: &mut Environment) -> Rc<RefCell<String>> {
    let out = Rc::new(RefCell::new(String::new()));
    let sink = out.clone();
    let cf = env.add_call_func(Rc::new(move |_env, thread, _args| {
        sink.borrow_mut().push_str(&String::from_utf8_lossy(&thread.print_buf));
        sink.borrow_mut().push('\n');
        thread.print_buf.clear();
        Ok(false)
    }));
    env.add_code_data_acs0(86, CodeData::call_func(cf, 0));
    out
}

fn boot(env: &mut Environment, names: &[&str]) -> Vec<usize> {
    let path = ScopePath::new(0, 0, 0);
    env.activate(path);
    let mut mids = Vec::new();
    for n in names {
        let name = env.get_module_name(n.as_bytes());
        mids.push(env.get_module(name).expect("module load"));
    }
    for &mid in &mids {
        env.add_module(path, mid).unwrap();
    }
    env.add_module_finish(path).unwrap();
    env.script_start_type(path, ScriptType::Open, &[]);
    mids
}

const PATH: ScopePath = ScopePath { gbl: 0, hub: 0, map: 0 };

// ---- scenarios --------------------------------------------------------

#[test]
fn open_script_prints_and_terminates() {
    // script 1 OPEN { Print(s:"hi"); }
    let image = acs0(
        &[85, 3, 0, 87, 86, 1],
        &[(1001, 0, 0)],
        &[b"hi".as_slice()],
    );
    let mut env = env_with(HashMap::from([("map", image)]));
    let out = capture_print(&mut env);
    boot(&mut env, &["map"]);

    assert!(env.has_active_thread());
    env.exec();
    assert_eq!(out.borrow().as_str(), "hi\n");
    assert!(!env.has_active_thread());
}

#[test]
fn delay_counts_down_in_ticks() {
    // script 2 OPEN { Delay(3); terminate }
    let image = acs0(&[56, 3, 1], &[(1002, 0, 0)], &[]);
    let mut env = env_with(HashMap::from([("map", image)]));
    boot(&mut env, &["map"]);

    env.exec();
    let threads = env.map_threads(PATH);
    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0].state, ThreadState::Paused);
    assert_eq!(threads[0].delay, 2);

    env.exec(); // delay 1
    env.exec(); // delay 0, running again
    assert!(env.has_active_thread());
    env.exec(); // terminate
    assert!(!env.has_active_thread());
}

#[test]
fn register_import_writes_through_to_exporter() {
    // Module a exports register "x"; module b imports it and writes 42.
    let mut a = Acse::new();
    a.chunk(b"MEXP", name_table(&[b"x".as_slice()]));
    let a = a.build();

    let mut b = Acse::new();
    let entry = b.code(&[3, 42, 26, 0, 1]);
    b.chunk(b"MIMP", mimp(&[(0, b"x".as_slice())]));
    b.sptr(&[(1, 1, entry, 0)]);
    let b = b.build();

    let mut env = env_with(HashMap::from([("a", a), ("b", b)]));
    let mids = boot(&mut env, &["a", "b"]);

    env.exec();
    assert_eq!(env.module_reg_get(PATH, mids[0], 0), 42);
    assert_eq!(env.module_reg_get(PATH, mids[1], 0), 42);
}

#[test]
fn reverse_order_import_survives_save_and_load() {
    // The importer is registered before its exporter; add_module_finish
    // fixes the binding up, and a state round trip must preserve it.
    let mut a = Acse::new();
    a.chunk(b"MEXP", name_table(&[b"x".as_slice()]));
    let a = a.build();

    let mut b = Acse::new();
    let entry = b.code(&[3, 42, 26, 0, 56, 2, 1]);
    b.chunk(b"MIMP", mimp(&[(0, b"x".as_slice())]));
    b.sptr(&[(1, 1, entry, 0)]);
    let b = b.build();

    let images = HashMap::from([("a", a), ("b", b)]);
    let mut env = env_with(images.clone());
    let mids = boot(&mut env, &["b", "a"]);
    env.exec(); // write 42, then delay
    assert_eq!(env.module_reg_get(PATH, mids[1], 0), 42);

    let mut saved = Vec::new();
    env.save_state(&mut saved).unwrap();

    let mut fresh = env_with(images);
    fresh.load_state(&mut saved.as_slice()).unwrap();

    let a_name = fresh.get_module_name(b"a");
    let a_mid = fresh.get_module(a_name).unwrap();
    let b_name = fresh.get_module_name(b"b");
    let b_mid = fresh.get_module(b_name).unwrap();
    assert_eq!(fresh.module_reg_get(PATH, a_mid, 0), 42);
    assert_eq!(fresh.module_reg_get(PATH, b_mid, 0), 42, "import must alias after restore");

    let threads = fresh.map_threads(PATH);
    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0].state, ThreadState::Paused);
}

#[test]
fn unresolved_import_is_an_error() {
    let mut b = Acse::new();
    b.chunk(b"MIMP", mimp(&[(0, b"nowhere".as_slice())]));
    let b = b.build();

    let mut env = env_with(HashMap::from([("b", b)]));
    let path = ScopePath::new(0, 0, 0);
    env.activate(path);
    let name = env.get_module_name(b"b");
    let mid = env.get_module(name).unwrap();
    env.add_module(path, mid).unwrap();
    let err = env.add_module_finish(path).unwrap_err();
    assert!(err.to_string().contains("nowhere"), "{err}");
}

#[test]
fn encrypted_string_table_decodes() {
    // "alpha" at chunk offset 0x40 with the default iteration seed.
    let offset = 0x40usize;
    let mut d = Vec::new();
    d.extend_from_slice(&0u32.to_le_bytes());
    d.extend_from_slice(&1u32.to_le_bytes());
    d.extend_from_slice(&0u32.to_le_bytes());
    d.extend_from_slice(&(offset as u32).to_le_bytes());
    d.resize(offset, 0);
    for (i, &b) in b"alpha\0".iter().enumerate() {
        d.push(b ^ ((offset * 4 ^ i) as u8));
    }

    let mut m = Acse::encrypted();
    m.chunk(b"STRL", d);
    let image = m.build();

    let mut env = env_with(HashMap::from([("m", image)]));
    let name = env.get_module_name(b"m");
    let mid = env.get_module(name).unwrap();
    let local = env.module(mid).strings[0];
    assert_eq!(env.strings.bytes(local), b"alpha");
}

#[test]
fn save_and_load_preserve_delay_timing() {
    let image = acs0(&[56, 3, 1], &[(1002, 0, 0)], &[]);
    let mut env = env_with(HashMap::from([("map", image.clone())]));
    boot(&mut env, &["map"]);
    env.exec(); // paused, delay = 2

    let mut saved = Vec::new();
    env.save_state(&mut saved).unwrap();

    let mut fresh = env_with(HashMap::from([("map", image)]));
    fresh.load_state(&mut saved.as_slice()).unwrap();

    let threads = fresh.map_threads(PATH);
    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0].state, ThreadState::Paused);
    assert_eq!(threads[0].delay, 2);

    // A re-save of the restored environment is byte-identical.
    let mut resaved = Vec::new();
    fresh.save_state(&mut resaved).unwrap();
    assert_eq!(saved, resaved);

    // The restored run terminates on the same logical tick.
    fresh.exec();
    fresh.exec();
    assert!(fresh.has_active_thread());
    fresh.exec();
    assert!(!fresh.has_active_thread());
}

#[test]
fn divide_by_zero_kills_only_the_offending_thread() {
    // script 1 divides by zero; script 2 delays one tick then exits.
    let code = [3, 1, 3, 0, 17, 1, /* script 2: */ 56, 2, 1];
    let image = acs0(&code, &[(1001, 0, 0), (1002, 6, 0)], &[]);
    let mut env = env_with(HashMap::from([("map", image)]));
    boot(&mut env, &["map"]);

    env.exec();
    let threads = env.map_threads(PATH);
    assert_eq!(threads.len(), 1, "faulting thread should be reclaimed");
    assert_eq!(threads[0].state, ThreadState::Paused);

    env.exec();
    env.exec();
    assert!(!env.has_active_thread());
}

#[test]
fn script_wait_wakes_on_termination() {
    // script 1 waits for script 2, then prints; script 2 delays 2 ticks.
    let code = [82, 2, 85, 3, 0, 87, 86, 1, /* script 2: */ 56, 2, 1];
    let image = acs0(&code, &[(1001, 0, 0), (1002, 8, 0)], &[b"done".as_slice()]);
    let mut env = env_with(HashMap::from([("map", image)]));
    let out = capture_print(&mut env);
    boot(&mut env, &["map"]);

    env.exec();
    assert_eq!(out.borrow().as_str(), "");
    env.exec();
    env.exec(); // script 2 terminates here, waking script 1
    env.exec(); // script 1 prints
    assert_eq!(out.borrow().as_str(), "done\n");
    assert!(!env.has_active_thread());
}

#[test]
fn budget_bounds_one_tick_without_terminating() {
    // script 1 OPEN { loop forever }
    let image = acs0(&[52, 8], &[(1001, 0, 0)], &[]);
    let mut env = env_with(HashMap::from([("map", image)]));
    env.exec_budget = 1_000;
    boot(&mut env, &["map"]);

    env.exec();
    let threads = env.map_threads(PATH);
    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0].state, ThreadState::Running, "budget exhaustion must not kill");
}

#[test]
fn reload_is_idempotent() {
    let image = acs0(&[85, 3, 0, 87, 86, 1], &[(1001, 0, 0)], &[b"hi".as_slice()]);
    let mut env = env_with(HashMap::from([("map", image.clone())]));
    let name = env.get_module_name(b"map");
    let mid = env.get_module(name).unwrap();

    let (code_len, scripts, strings) = {
        let m = env.module(mid);
        (m.code.len(), m.scripts.len(), m.strings.clone())
    };
    env.read_bytecode(mid, &image).unwrap();
    let m = env.module(mid);
    assert_eq!(m.code.len(), code_len);
    assert_eq!(m.scripts.len(), scripts);
    assert_eq!(m.strings, strings);
    assert!(m.loaded);
}

#[test]
fn script_stop_is_observed_at_a_scheduling_boundary() {
    // script 1 OPEN { Delay(100); }
    let image = acs0(&[56, 100, 1], &[(1001, 0, 0)], &[]);
    let mut env = env_with(HashMap::from([("map", image)]));
    boot(&mut env, &["map"]);
    env.exec();
    assert!(env.has_active_thread());

    env.script_stop(PATH, acsvm::ScriptIdent::Num(1));
    env.exec();
    assert!(!env.has_active_thread());
}

#[test]
fn start_does_not_duplicate_running_scripts() {
    let image = acs0(&[56, 50, 1], &[(1001, 0, 0)], &[]);
    let mut env = env_with(HashMap::from([("map", image)]));
    boot(&mut env, &["map"]);
    env.exec();

    assert!(!env.script_start(PATH, acsvm::ScriptIdent::Num(1), &[]).unwrap());
    assert!(env.script_start_forced(PATH, acsvm::ScriptIdent::Num(1), &[]).unwrap());
    assert_eq!(env.map_threads(PATH).len(), 2);
}

#[test]
fn script_args_land_in_leading_locals() {
    // script 1 (2 args), started by hand: prints arg0 + arg1.
    let code = [28, 0, 28, 1, 14, 88, 86, 1];
    let image = acs0(&code, &[(1, 0, 2)], &[]);
    let mut env = env_with(HashMap::from([("map", image)]));
    let out = capture_print(&mut env);
    let path = ScopePath::new(0, 0, 0);
    env.activate(path);
    let name = env.get_module_name(b"map");
    let mid = env.get_module(name).unwrap();
    env.add_module(path, mid).unwrap();
    env.add_module_finish(path).unwrap();

    assert!(env.script_start(path, acsvm::ScriptIdent::Num(1), &[40, 2]).unwrap());
    env.exec();
    assert_eq!(out.borrow().as_str(), "42\n");
    assert!(!env.has_active_thread());
}

#[test]
fn word_arithmetic_wraps_and_compares_signed() {
    // -1 + 1 wraps to 0, so the ifnotgoto at word 5 reaches the print
    // block at word 8 (byte offset 40).
    let code = [
        3, 0xFFFF_FFFFu32 as Word, 3, 1, 14, 79, 40, 1, /* word 8: */ 85, 3, 0, 87, 86, 1,
    ];
    let image = acs0(&code, &[(1001, 0, 0)], &[b"z".as_slice()]);
    let mut env = env_with(HashMap::from([("map", image)]));
    let out = capture_print(&mut env);
    boot(&mut env, &["map"]);
    env.exec();
    assert_eq!(out.borrow().as_str(), "z\n");
}
