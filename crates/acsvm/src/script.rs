use bitflags::bitflags;

use crate::module::ModuleId;
use crate::string::StringIdx;
use crate::Word;

/// Script type tags as they appear in bytecode. Old-style directories
/// encode the type as `id / 1000`; SPTR chunks carry it separately.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum ScriptType {
    Closed = 0,
    Open = 1,
    Respawn = 2,
    Death = 3,
    Enter = 4,
    Pickup = 5,
    BlueReturn = 6,
    RedReturn = 7,
    WhiteReturn = 8,
    Lightning = 12,
    Unloading = 13,
    Disconnect = 14,
    Return = 15,
}

impl ScriptType {
    pub fn from_word(w: Word) -> ScriptType {
        match w {
            0 => ScriptType::Closed,
            1 => ScriptType::Open,
            2 => ScriptType::Respawn,
            3 => ScriptType::Death,
            4 => ScriptType::Enter,
            5 => ScriptType::Pickup,
            6 => ScriptType::BlueReturn,
            7 => ScriptType::RedReturn,
            8 => ScriptType::WhiteReturn,
            12 => ScriptType::Lightning,
            13 => ScriptType::Unloading,
            14 => ScriptType::Disconnect,
            15 => ScriptType::Return,
            other => {
                log::warn!("unknown script type {other}, treating as closed");
                ScriptType::Closed
            }
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ScriptFlags: u16 {
        const NET = 0x0001;
        const CLIENT_SIDE = 0x0002;
    }
}

/// Static descriptor of a script entry point.
#[derive(Clone, Debug)]
pub struct Script {
    pub number: Word,
    pub name: Option<StringIdx>,
    pub stype: ScriptType,
    pub flags: ScriptFlags,
    pub argc: u32,
    pub loc_reg_count: u32,
    pub loc_arr_count: u32,
    /// Index into the owning module's translated code.
    pub code_idx: u32,
    pub module: ModuleId,
}

/// Static descriptor of a callable routine (FUNC chunk).
#[derive(Clone, Debug)]
pub struct Function {
    pub argc: u32,
    pub loc_reg_count: u32,
    pub loc_arr_count: u32,
    pub has_return: bool,
    pub code_idx: u32,
    pub module: ModuleId,
}

/// How the host names a script when starting or signalling one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScriptIdent {
    Num(Word),
    Name(StringIdx),
}

impl Script {
    pub fn matches(&self, ident: ScriptIdent) -> bool {
        match ident {
            ScriptIdent::Num(n) => self.name.is_none() && self.number == n,
            ScriptIdent::Name(s) => self.name == Some(s),
        }
    }
}
