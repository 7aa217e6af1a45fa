//! Key tables: user-visible names ↔ Linux evdev codes ↔ HID usage IDs.
//!
//! The modifier block (usages 224..=231) is special-cased everywhere: it is
//! carried in byte 0 of the boot report as a bitmask instead of occupying one
//! of the six key slots.

/// First HID usage of the modifier block (Left Ctrl).
pub const MOD_USAGE_MIN: u8 = 224;
/// Last HID usage of the modifier block (Right GUI).
pub const MOD_USAGE_MAX: u8 = 231;

/// Commonly referenced usages.
pub const USAGE_SPACE: u8 = 44;
pub const USAGE_ARROW_RIGHT: u8 = 79;
pub const USAGE_ARROW_LEFT: u8 = 80;
pub const USAGE_ARROW_DOWN: u8 = 81;
pub const USAGE_ARROW_UP: u8 = 82;

/// Key name → evdev key code. Names are uppercase; a handful of aliases
/// (CTRL/LCTL, LWIN, RETURN, punctuation) match what users type in hotkey
/// specs and skill configs.
static NAME_TO_CODE: phf::Map<&'static str, u16> = phf::phf_map! {
    // Modifiers
    "LCTRL" => 29u16, "LCTL" => 29u16, "CTRL" => 29u16, "CONTROL" => 29u16,
    "LSHIFT" => 42u16,
    "LALT" => 56u16,
    "LMETA" => 125u16, "LGUI" => 125u16, "LWIN" => 125u16,
    "RCTRL" => 97u16, "RCTL" => 97u16,
    "RSHIFT" => 54u16,
    "RALT" => 100u16,
    "RMETA" => 126u16, "RGUI" => 126u16, "RWIN" => 126u16,
    // Letters
    "A" => 30u16, "B" => 48u16, "C" => 46u16, "D" => 32u16, "E" => 18u16,
    "F" => 33u16, "G" => 34u16, "H" => 35u16, "I" => 23u16, "J" => 36u16,
    "K" => 37u16, "L" => 38u16, "M" => 50u16, "N" => 49u16, "O" => 24u16,
    "P" => 25u16, "Q" => 16u16, "R" => 19u16, "S" => 31u16, "T" => 20u16,
    "U" => 22u16, "V" => 47u16, "W" => 17u16, "X" => 45u16, "Y" => 21u16,
    "Z" => 44u16,
    // Number row
    "1" => 2u16, "2" => 3u16, "3" => 4u16, "4" => 5u16, "5" => 6u16,
    "6" => 7u16, "7" => 8u16, "8" => 9u16, "9" => 10u16, "0" => 11u16,
    // Controls & punctuation
    "ENTER" => 28u16, "RETURN" => 28u16,
    "ESC" => 1u16, "ESCAPE" => 1u16,
    "BACKSPACE" => 14u16, "TAB" => 15u16, "SPACE" => 57u16,
    "MINUS" => 12u16, "-" => 12u16,
    "EQUAL" => 13u16, "=" => 13u16,
    "LEFTBRACE" => 26u16, "[" => 26u16,
    "RIGHTBRACE" => 27u16, "]" => 27u16,
    "BACKSLASH" => 43u16, "\\" => 43u16,
    "SEMICOLON" => 39u16, ";" => 39u16,
    "APOSTROPHE" => 40u16, "'" => 40u16,
    "GRAVE" => 41u16, "`" => 41u16,
    "COMMA" => 51u16, "," => 51u16,
    "DOT" => 52u16, "." => 52u16,
    "SLASH" => 53u16, "/" => 53u16,
    "CAPSLOCK" => 58u16,
    // Function keys
    "F1" => 59u16, "F2" => 60u16, "F3" => 61u16, "F4" => 62u16,
    "F5" => 63u16, "F6" => 64u16, "F7" => 65u16, "F8" => 66u16,
    "F9" => 67u16, "F10" => 68u16, "F11" => 87u16, "F12" => 88u16,
    // Navigation
    "RIGHT" => 106u16, "LEFT" => 105u16, "DOWN" => 108u16, "UP" => 103u16,
    "INSERT" => 110u16, "HOME" => 102u16, "PAGEUP" => 104u16,
    "DELETE" => 111u16, "END" => 107u16, "PAGEDOWN" => 109u16,
    "PRINT" => 99u16, "SCROLLLOCK" => 70u16, "PAUSE" => 119u16,
    // Numeric keypad
    "NUMLOCK" => 69u16,
    "KP_SLASH" => 98u16, "KP_ASTERISK" => 55u16,
    "KP_MINUS" => 74u16, "KP_PLUS" => 78u16, "KP_ENTER" => 96u16,
    "KP_1" => 79u16, "KP_2" => 80u16, "KP_3" => 81u16,
    "KP_4" => 75u16, "KP_5" => 76u16, "KP_6" => 77u16,
    "KP_7" => 71u16, "KP_8" => 72u16, "KP_9" => 73u16,
    "KP_0" => 82u16, "KP_DOT" => 83u16,
    "NUMPAD_1" => 79u16, "NUMPAD_2" => 80u16, "NUMPAD_3" => 81u16,
    "NUMPAD_4" => 75u16, "NUMPAD_5" => 76u16, "NUMPAD_6" => 77u16,
    "NUMPAD_7" => 71u16, "NUMPAD_8" => 72u16, "NUMPAD_9" => 73u16,
    "NUMPAD_0" => 82u16, "NUMPAD_DOT" => 83u16,
    "NUMPAD_SLASH" => 98u16, "NUMPAD_ASTERISK" => 55u16,
    "NUMPAD_MINUS" => 74u16, "NUMPAD_PLUS" => 78u16, "NUMPAD_ENTER" => 96u16,
    // System
    "MENU" => 127u16, "POWER" => 116u16, "SLEEP" => 142u16,
};

/// evdev key code → HID usage ID for non-modifier keys.
static CODE_TO_USAGE: phf::Map<u16, u8> = phf::phf_map! {
    // Letters
    30u16 => 4u8, 48u16 => 5u8, 46u16 => 6u8, 32u16 => 7u8, 18u16 => 8u8,
    33u16 => 9u8, 34u16 => 10u8, 35u16 => 11u8, 23u16 => 12u8, 36u16 => 13u8,
    37u16 => 14u8, 38u16 => 15u8, 50u16 => 16u8, 49u16 => 17u8, 24u16 => 18u8,
    25u16 => 19u8, 16u16 => 20u8, 19u16 => 21u8, 31u16 => 22u8, 20u16 => 23u8,
    22u16 => 24u8, 47u16 => 25u8, 17u16 => 26u8, 45u16 => 27u8, 21u16 => 28u8,
    44u16 => 29u8,
    // Number row
    2u16 => 30u8, 3u16 => 31u8, 4u16 => 32u8, 5u16 => 33u8, 6u16 => 34u8,
    7u16 => 35u8, 8u16 => 36u8, 9u16 => 37u8, 10u16 => 38u8, 11u16 => 39u8,
    // Controls & punctuation
    28u16 => 40u8, 1u16 => 41u8, 14u16 => 42u8, 15u16 => 43u8,
    57u16 => 44u8, 12u16 => 45u8, 13u16 => 46u8, 26u16 => 47u8,
    27u16 => 48u8, 43u16 => 49u8, 39u16 => 51u8,
    40u16 => 52u8, 41u16 => 53u8, 51u16 => 54u8, 52u16 => 55u8,
    53u16 => 56u8, 58u16 => 57u8,
    // Function keys
    59u16 => 58u8, 60u16 => 59u8, 61u16 => 60u8, 62u16 => 61u8, 63u16 => 62u8,
    64u16 => 63u8, 65u16 => 64u8, 66u16 => 65u8, 67u16 => 66u8, 68u16 => 67u8,
    87u16 => 68u8, 88u16 => 69u8,
    // Navigation
    99u16 => 70u8, 70u16 => 71u8, 119u16 => 72u8, 110u16 => 73u8,
    102u16 => 74u8, 104u16 => 75u8, 111u16 => 76u8, 107u16 => 77u8,
    109u16 => 78u8, 106u16 => 79u8, 105u16 => 80u8, 108u16 => 81u8,
    103u16 => 82u8,
    // Numeric keypad
    69u16 => 83u8, 98u16 => 84u8, 55u16 => 85u8, 74u16 => 86u8,
    78u16 => 87u8, 96u16 => 88u8, 79u16 => 89u8, 80u16 => 90u8,
    81u16 => 91u8, 75u16 => 92u8, 76u16 => 93u8, 77u16 => 94u8,
    71u16 => 95u8, 72u16 => 96u8, 73u16 => 97u8, 82u16 => 98u8,
    83u16 => 99u8,
    // Extended function keys
    183u16 => 104u8, 184u16 => 105u8, 185u16 => 106u8, 186u16 => 107u8,
    187u16 => 108u8, 188u16 => 109u8, 189u16 => 110u8, 190u16 => 111u8,
    191u16 => 112u8, 192u16 => 113u8, 193u16 => 114u8, 194u16 => 115u8,
    // System & international
    127u16 => 118u8, 116u16 => 102u8, 86u16 => 100u8,
};

/// Modifier evdev codes in bit order (byte 0 of the report):
/// LCTRL, LSHIFT, LALT, LMETA, RCTRL, RSHIFT, RALT, RMETA.
const MOD_CODES: [u16; 8] = [29, 42, 56, 125, 97, 54, 100, 126];

#[inline]
pub fn is_modifier_code(code: u16) -> bool {
    MOD_CODES.contains(&code)
}

/// Report bitmask bit for a modifier evdev code (0 for non-modifiers).
#[inline]
pub fn mod_bit(code: u16) -> u8 {
    MOD_CODES
        .iter()
        .position(|&c| c == code)
        .map_or(0, |i| 1 << i)
}

/// HID usage for any evdev key code, modifier or not. Returns 0 when the
/// code is unmapped.
pub fn usage_from_code(code: u16) -> u8 {
    if let Some(i) = MOD_CODES.iter().position(|&c| c == code) {
        return MOD_USAGE_MIN + i as u8;
    }
    CODE_TO_USAGE.get(&code).copied().unwrap_or(0)
}

#[inline]
pub fn is_modifier_usage(usage: u8) -> bool {
    (MOD_USAGE_MIN..=MOD_USAGE_MAX).contains(&usage)
}

/// Report bitmask bit for a modifier usage. Callers must ensure
/// `is_modifier_usage(usage)`.
#[inline]
pub fn mod_bit_for_usage(usage: u8) -> u8 {
    1 << (usage - MOD_USAGE_MIN)
}

/// Resolve a user-visible key name to its evdev code (case-insensitive).
pub fn name_to_code(name: &str) -> Option<u16> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return None;
    }
    NAME_TO_CODE.get(trimmed.to_ascii_uppercase().as_str()).copied()
}

/// Resolve a user-visible key name to a HID usage ID. Returns 0 when the
/// name is unknown, matching how skill configs treat unmapped keystrokes.
pub fn name_to_usage(name: &str) -> u8 {
    name_to_code(name).map_or(0, usage_from_code)
}

/// A parsed `MOD+KEY` hotkey.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hotkey {
    pub mod_code: u16,
    pub key_code: u16,
    pub key_usage: u8,
}

/// Parse a hotkey spec of the shape `LCTRL+Q`. Exactly one modifier plus one
/// non-modifier key is accepted.
pub fn parse_hotkey(spec: &str) -> crate::error::Result<Hotkey> {
    let mut parts = spec.split('+');
    let (mod_name, key_name) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(k), None) => (m.trim(), k.trim()),
        _ => {
            return Err(crate::error::Error::protocol(format!(
                "hotkey must be MOD+KEY (e.g. LCTRL+Q), got {spec:?}"
            )))
        }
    };
    let mod_code = name_to_code(mod_name)
        .filter(|&c| is_modifier_code(c))
        .ok_or_else(|| crate::error::Error::protocol(format!("unknown modifier {mod_name:?}")))?;
    let key_code = name_to_code(key_name)
        .filter(|&c| !is_modifier_code(c))
        .ok_or_else(|| {
            crate::error::Error::protocol(format!("hotkey key must be a non-modifier, got {key_name:?}"))
        })?;
    Ok(Hotkey {
        mod_code,
        key_code,
        key_usage: usage_from_code(key_code),
    })
}
