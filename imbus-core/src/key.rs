//! Key events: keysym code, modifier mask, keyboard layout; string form `Control+Shift+a`.

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;

bitflags! {
    /// Modifier mask carried by every key event (16 bits on the wire).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct KeyMask: u16 {
        const SHIFT = 1 << 0;
        const CAPS_LOCK = 1 << 1;
        const CONTROL = 1 << 2;
        const ALT = 1 << 3;
        const META = 1 << 4;
        const SUPER = 1 << 5;
        const HYPER = 1 << 6;
        const NUM_LOCK = 1 << 7;
        const SCROLL_LOCK = 1 << 8;
        /// Set on key-up events.
        const RELEASE = 1 << 15;
    }
}

impl KeyMask {
    /// Lock-state bits that describe keyboard state rather than a held key.
    pub const LOCKS: KeyMask = KeyMask::CAPS_LOCK
        .union(KeyMask::NUM_LOCK)
        .union(KeyMask::SCROLL_LOCK);
}

/// X11 keysym values used by the built-in key name table.
pub mod keysym {
    pub const BACKSPACE: u32 = 0xff08;
    pub const TAB: u32 = 0xff09;
    pub const RETURN: u32 = 0xff0d;
    pub const ESCAPE: u32 = 0xff1b;
    pub const HOME: u32 = 0xff50;
    pub const LEFT: u32 = 0xff51;
    pub const UP: u32 = 0xff52;
    pub const RIGHT: u32 = 0xff53;
    pub const DOWN: u32 = 0xff54;
    pub const PAGE_UP: u32 = 0xff55;
    pub const PAGE_DOWN: u32 = 0xff56;
    pub const END: u32 = 0xff57;
    pub const INSERT: u32 = 0xff63;
    pub const F1: u32 = 0xffbe;
    pub const F12: u32 = 0xffc9;
    pub const SHIFT_L: u32 = 0xffe1;
    pub const SHIFT_R: u32 = 0xffe2;
    pub const CONTROL_L: u32 = 0xffe3;
    pub const CONTROL_R: u32 = 0xffe4;
    pub const CAPS_LOCK: u32 = 0xffe5;
    pub const META_L: u32 = 0xffe7;
    pub const META_R: u32 = 0xffe8;
    pub const ALT_L: u32 = 0xffe9;
    pub const ALT_R: u32 = 0xffea;
    pub const SUPER_L: u32 = 0xffeb;
    pub const SUPER_R: u32 = 0xffec;
    pub const HYPER_L: u32 = 0xffed;
    pub const HYPER_R: u32 = 0xffee;
    pub const DELETE: u32 = 0xffff;
    pub const SPACE: u32 = 0x0020;
    /// Unicode characters outside Latin-1 map to `0x0100_0000 | code point`.
    pub const UNICODE_OFFSET: u32 = 0x0100_0000;
}

const KEY_NAMES: &[(&str, u32)] = &[
    ("space", keysym::SPACE),
    ("BackSpace", keysym::BACKSPACE),
    ("Tab", keysym::TAB),
    ("Return", keysym::RETURN),
    ("Escape", keysym::ESCAPE),
    ("Home", keysym::HOME),
    ("Left", keysym::LEFT),
    ("Up", keysym::UP),
    ("Right", keysym::RIGHT),
    ("Down", keysym::DOWN),
    ("Page_Up", keysym::PAGE_UP),
    ("Page_Down", keysym::PAGE_DOWN),
    ("End", keysym::END),
    ("Insert", keysym::INSERT),
    ("Delete", keysym::DELETE),
    ("Shift_L", keysym::SHIFT_L),
    ("Shift_R", keysym::SHIFT_R),
    ("Control_L", keysym::CONTROL_L),
    ("Control_R", keysym::CONTROL_R),
    ("Caps_Lock", keysym::CAPS_LOCK),
    ("Meta_L", keysym::META_L),
    ("Meta_R", keysym::META_R),
    ("Alt_L", keysym::ALT_L),
    ("Alt_R", keysym::ALT_R),
    ("Super_L", keysym::SUPER_L),
    ("Super_R", keysym::SUPER_R),
    ("Hyper_L", keysym::HYPER_L),
    ("Hyper_R", keysym::HYPER_R),
];

const MODIFIER_NAMES: &[(&str, KeyMask)] = &[
    ("Shift", KeyMask::SHIFT),
    ("CapsLock", KeyMask::CAPS_LOCK),
    ("Control", KeyMask::CONTROL),
    ("Alt", KeyMask::ALT),
    ("Meta", KeyMask::META),
    ("Super", KeyMask::SUPER),
    ("Hyper", KeyMask::HYPER),
    ("NumLock", KeyMask::NUM_LOCK),
    ("ScrollLock", KeyMask::SCROLL_LOCK),
];

const RELEASE_NAME: &str = "KeyRelease";

/// A single key press or release as exchanged between front ends and engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct KeyEvent {
    pub code: u32,
    pub mask: KeyMask,
    pub layout: u32,
}

impl KeyEvent {
    pub fn new(code: u32, mask: KeyMask) -> Self {
        Self {
            code,
            mask,
            layout: 0,
        }
    }

    pub fn press(code: u32, mask: KeyMask) -> Self {
        Self::new(code, mask - KeyMask::RELEASE)
    }

    pub fn release(code: u32, mask: KeyMask) -> Self {
        Self::new(code, mask | KeyMask::RELEASE)
    }

    pub fn is_release(&self) -> bool {
        self.mask.contains(KeyMask::RELEASE)
    }

    /// The modifier bit this key itself toggles, if it is a modifier key.
    pub fn modifier_bit(&self) -> Option<KeyMask> {
        match self.code {
            keysym::SHIFT_L | keysym::SHIFT_R => Some(KeyMask::SHIFT),
            keysym::CONTROL_L | keysym::CONTROL_R => Some(KeyMask::CONTROL),
            keysym::ALT_L | keysym::ALT_R => Some(KeyMask::ALT),
            keysym::META_L | keysym::META_R => Some(KeyMask::META),
            keysym::SUPER_L | keysym::SUPER_R => Some(KeyMask::SUPER),
            keysym::HYPER_L | keysym::HYPER_R => Some(KeyMask::HYPER),
            keysym::CAPS_LOCK => Some(KeyMask::CAPS_LOCK),
            _ => None,
        }
    }

    pub fn is_modifier(&self) -> bool {
        self.modifier_bit().is_some()
    }

    /// Character produced by this key, for printable keysyms.
    pub fn to_char(&self) -> Option<char> {
        match self.code {
            0x20..=0x7e | 0xa0..=0xff => char::from_u32(self.code),
            c if c & 0xff00_0000 == keysym::UNICODE_OFFSET => char::from_u32(c & 0x00ff_ffff),
            _ => None,
        }
    }

    fn code_from_name(name: &str) -> Option<u32> {
        if let Some((_, code)) = KEY_NAMES.iter().find(|(n, _)| *n == name) {
            return Some(*code);
        }
        if let Some(n) = name.strip_prefix('F') {
            if let Ok(i) = n.parse::<u32>() {
                if (1..=12).contains(&i) {
                    return Some(keysym::F1 + i - 1);
                }
            }
        }
        if let Some(hex) = name.strip_prefix("0x") {
            return u32::from_str_radix(hex, 16).ok();
        }
        let mut chars = name.chars();
        let c = chars.next()?;
        if chars.next().is_some() {
            return None;
        }
        let cp = c as u32;
        Some(match cp {
            0x20..=0x7e | 0xa0..=0xff => cp,
            _ => keysym::UNICODE_OFFSET | cp,
        })
    }

    fn code_name(code: u32) -> String {
        if let Some((name, _)) = KEY_NAMES.iter().find(|(_, c)| *c == code) {
            return (*name).to_string();
        }
        if (keysym::F1..=keysym::F12).contains(&code) {
            return format!("F{}", code - keysym::F1 + 1);
        }
        match KeyEvent::new(code, KeyMask::empty()).to_char() {
            Some(c) if !c.is_whitespace() && c != '+' => c.to_string(),
            _ => format!("0x{:04x}", code),
        }
    }
}

impl fmt::Display for KeyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, bit) in MODIFIER_NAMES {
            if self.mask.contains(*bit) {
                write!(f, "{}+", name)?;
            }
        }
        f.write_str(&Self::code_name(self.code))?;
        if self.is_release() {
            write!(f, "+{}", RELEASE_NAME)?;
        }
        Ok(())
    }
}

/// Error parsing a key string.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KeyParseError {
    #[error("empty key string")]
    Empty,
    #[error("unknown key name: {0}")]
    UnknownKey(String),
    #[error("key string has more than one key: {0}")]
    MultipleKeys(String),
}

impl FromStr for KeyEvent {
    type Err = KeyParseError;

    /// Parses `Modifier+...+KeyName[+KeyRelease]`. A lone `+` names the plus key.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(KeyParseError::Empty);
        }
        let mut mask = KeyMask::empty();
        let mut code = None;
        let mut parts: Vec<&str> = s.split('+').collect();
        // "Control++" splits into ["Control", "", ""]: the trailing pair is the plus key.
        if s.ends_with("++") || s == "+" {
            parts.truncate(parts.len().saturating_sub(2));
            code = Some('+' as u32);
        }
        for part in parts {
            if part == RELEASE_NAME {
                mask |= KeyMask::RELEASE;
            } else if let Some((_, bit)) = MODIFIER_NAMES.iter().find(|(n, _)| *n == part) {
                mask |= *bit;
            } else {
                let c = Self::code_from_name(part)
                    .ok_or_else(|| KeyParseError::UnknownKey(part.to_string()))?;
                if code.replace(c).is_some() {
                    return Err(KeyParseError::MultipleKeys(s.to_string()));
                }
            }
        }
        let code = code.ok_or_else(|| KeyParseError::UnknownKey(s.to_string()))?;
        Ok(KeyEvent::new(code, mask))
    }
}

/// Parse a comma-separated list of key strings (`"Control+space,Shift+Shift_L+KeyRelease"`).
pub fn parse_key_list(s: &str) -> Result<Vec<KeyEvent>, KeyParseError> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::parse)
        .collect()
}
