//! acsvm
//!
//! An ACS bytecode virtual machine. The host feeds it module bytes,
//! registers call-funcs, activates a scope chain and drives the tick;
//! the VM loads and links modules, owns all shared state, and runs
//! scripts cooperatively against a per-tick instruction budget.
//!
//! ```no_run
//! use std::rc::Rc;
//! use acsvm::{Environment, ScopePath, ScriptType};
//!
//! let mut env = Environment::new();
//! env.set_module_loader(Rc::new(|name| std::fs::read(name.text_lossy())));
//!
//! let path = ScopePath::new(0, 0, 0);
//! env.activate(path);
//! let module = env.get_module(env.get_module_name(b"map01.o")).unwrap();
//! env.add_module(path, module).unwrap();
//! env.add_module_finish(path).unwrap();
//! env.script_start_type(path, ScriptType::Open, &[]);
//! while env.has_active_thread() {
//!     env.exec();
//! }
//! ```

pub mod code;
pub mod environment;
pub mod error;
pub mod format;
mod interp;
pub mod module;
pub mod scope;
pub mod script;
pub mod serial;
pub mod string;
pub mod thread;

/// The VM's uniform 32-bit value type. Signed operations reinterpret as
/// two's-complement.
pub type Word = u32;

pub use code::{Code, CodeData};
pub use environment::{CallFunc, Environment, ErrorHook, ModuleLoader, ScriptEndHook};
pub use error::{Error, Result};
pub use module::{Module, ModuleId, ModuleName};
pub use scope::{Array, GlobalScope, HubScope, MapScope, ScopePath};
pub use script::{Function, Script, ScriptFlags, ScriptIdent, ScriptType};
pub use string::{StringIdx, StringTable, STR_NONE};
pub use thread::{Thread, ThreadId, ThreadState};
