//! Hotkey matching over a live key-event stream.
//!
//! Chords are normalized before lookup: lock-state bits are dropped, and a modifier key's own bit
//! is dropped from its own event (X reports `Control` set on the release of `Control_L` but not on
//! its press). A chord carrying [`KeyMask::RELEASE`] fires on key-up, and only when that key-up
//! directly follows the press of the same key.

use std::collections::HashMap;

use crate::key::{KeyEvent, KeyMask};

type Chord = (u32, KeyMask);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hit {
    Press(Chord),
    Release(Chord),
}

/// Maps key chords to ids of type `T`. Matching state reflects only the latest [`push`](Self::push).
#[derive(Debug, Clone)]
pub struct HotkeyMatcher<T> {
    press: HashMap<Chord, T>,
    release: HashMap<Chord, T>,
    last_press: Option<Chord>,
    hit: Option<Hit>,
}

impl<T> Default for HotkeyMatcher<T> {
    fn default() -> Self {
        Self {
            press: HashMap::new(),
            release: HashMap::new(),
            last_press: None,
            hit: None,
        }
    }
}

fn normalize(event: &KeyEvent) -> Chord {
    let mut mask = event.mask - KeyMask::LOCKS - KeyMask::RELEASE;
    if let Some(own) = event.modifier_bit() {
        mask -= own;
    }
    (event.code, mask)
}

impl<T> HotkeyMatcher<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `chord` to `id`, replacing any earlier binding of the same chord.
    pub fn add(&mut self, chord: KeyEvent, id: T) {
        let key = normalize(&chord);
        if chord.is_release() {
            self.release.insert(key, id);
        } else {
            self.press.insert(key, id);
        }
    }

    pub fn add_many(&mut self, chords: &[KeyEvent], id: T)
    where
        T: Clone,
    {
        for chord in chords {
            self.add(*chord, id.clone());
        }
    }

    pub fn remove_all(&mut self) {
        self.press.clear();
        self.release.clear();
        self.reset();
    }

    /// Forget the press history and the last match.
    pub fn reset(&mut self) {
        self.last_press = None;
        self.hit = None;
    }

    pub fn len(&self) -> usize {
        self.press.len() + self.release.len()
    }

    pub fn is_empty(&self) -> bool {
        self.press.is_empty() && self.release.is_empty()
    }

    /// Feed one event. Returns whether it matched a bound chord.
    pub fn push(&mut self, event: &KeyEvent) -> bool {
        let chord = normalize(event);
        self.hit = if event.is_release() {
            let armed = self.last_press.take() == Some(chord);
            (armed && self.release.contains_key(&chord)).then_some(Hit::Release(chord))
        } else {
            self.last_press = Some(chord);
            self.press.contains_key(&chord).then_some(Hit::Press(chord))
        };
        self.hit.is_some()
    }

    pub fn is_matched(&self) -> bool {
        self.hit.is_some()
    }

    /// Id bound to the chord matched by the last push.
    pub fn match_result(&self) -> Option<&T> {
        match self.hit? {
            Hit::Press(chord) => self.press.get(&chord),
            Hit::Release(chord) => self.release.get(&chord),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::keysym;

    const A: u32 = 0x61;

    fn key(s: &str) -> KeyEvent {
        s.parse().unwrap()
    }

    #[test]
    fn press_chord_needs_exact_mask() {
        let mut m = HotkeyMatcher::new();
        m.add(key("Control+a"), "select-all");

        assert!(m.push(&KeyEvent::press(A, KeyMask::CONTROL)));
        assert_eq!(m.match_result(), Some(&"select-all"));

        assert!(!m.push(&KeyEvent::press(A, KeyMask::CONTROL | KeyMask::SHIFT)));
        assert_eq!(m.match_result(), None);
        assert!(!m.push(&KeyEvent::press(A, KeyMask::empty())));
        assert!(!m.push(&KeyEvent::release(A, KeyMask::CONTROL)));
    }

    #[test]
    fn lock_state_ignored() {
        let mut m = HotkeyMatcher::new();
        m.add(key("Control+space"), 1);
        let ev = KeyEvent::press(keysym::SPACE, KeyMask::CONTROL | KeyMask::NUM_LOCK | KeyMask::CAPS_LOCK);
        assert!(m.push(&ev));
    }

    #[test]
    fn bare_modifier_release_matches() {
        let mut m = HotkeyMatcher::new();
        m.add(key("Control+Control_L+KeyRelease"), "toggle");

        assert!(!m.push(&KeyEvent::press(keysym::CONTROL_L, KeyMask::empty())));
        assert!(m.push(&KeyEvent::release(keysym::CONTROL_L, KeyMask::CONTROL)));
        assert_eq!(m.match_result(), Some(&"toggle"));
    }

    #[test]
    fn modifier_used_in_combination_does_not_match() {
        let mut m = HotkeyMatcher::new();
        m.add(key("Control_L+KeyRelease"), "toggle");
        m.add(key("Control+a"), "select-all");

        assert!(!m.push(&KeyEvent::press(keysym::CONTROL_L, KeyMask::empty())));
        assert!(m.push(&KeyEvent::press(A, KeyMask::CONTROL)));
        assert!(!m.push(&KeyEvent::release(A, KeyMask::CONTROL)));
        assert!(!m.push(&KeyEvent::release(keysym::CONTROL_L, KeyMask::CONTROL)));
        assert!(!m.is_matched());
    }

    #[test]
    fn release_needs_matching_press_state() {
        let mut m = HotkeyMatcher::new();
        m.add(key("Shift_L+KeyRelease"), 7);

        // Shift released while Control was held is a different chord.
        m.push(&KeyEvent::press(keysym::SHIFT_L, KeyMask::CONTROL));
        assert!(!m.push(&KeyEvent::release(keysym::SHIFT_L, KeyMask::CONTROL | KeyMask::SHIFT)));

        // A release with no press seen does not fire.
        assert!(!m.push(&KeyEvent::release(keysym::SHIFT_L, KeyMask::SHIFT)));

        // Auto-repeated presses keep the chord armed.
        m.push(&KeyEvent::press(keysym::SHIFT_L, KeyMask::empty()));
        m.push(&KeyEvent::press(keysym::SHIFT_L, KeyMask::SHIFT));
        assert!(m.push(&KeyEvent::release(keysym::SHIFT_L, KeyMask::SHIFT)));
    }

    #[test]
    fn last_registration_wins() {
        let mut m = HotkeyMatcher::new();
        m.add(key("Control_L+KeyRelease"), "first");
        m.add(key("Control+Control_L+KeyRelease"), "second");
        assert_eq!(m.len(), 1);

        m.push(&KeyEvent::press(keysym::CONTROL_L, KeyMask::empty()));
        m.push(&KeyEvent::release(keysym::CONTROL_L, KeyMask::CONTROL));
        assert_eq!(m.match_result(), Some(&"second"));
    }

    #[test]
    fn add_many_and_remove_all() {
        let mut m = HotkeyMatcher::new();
        m.add_many(&[key("Control+space"), key("Shift+space")], "trigger");
        assert_eq!(m.len(), 2);
        assert!(m.push(&KeyEvent::press(keysym::SPACE, KeyMask::SHIFT)));
        assert_eq!(m.match_result(), Some(&"trigger"));

        m.remove_all();
        assert!(m.is_empty());
        assert!(!m.is_matched());
        assert!(!m.push(&KeyEvent::press(keysym::SPACE, KeyMask::SHIFT)));
    }

    #[test]
    fn result_cleared_by_next_push() {
        let mut m = HotkeyMatcher::new();
        m.add(key("F1"), 1);
        assert!(m.push(&KeyEvent::press(keysym::F1, KeyMask::empty())));
        assert!(m.is_matched());
        m.push(&KeyEvent::press(A, KeyMask::empty()));
        assert!(!m.is_matched());
        assert_eq!(m.match_result(), None);
    }

    #[test]
    fn reset_disarms_release() {
        let mut m = HotkeyMatcher::new();
        m.add(key("Alt_L+KeyRelease"), 1);
        m.push(&KeyEvent::press(keysym::ALT_L, KeyMask::empty()));
        m.reset();
        assert!(!m.push(&KeyEvent::release(keysym::ALT_L, KeyMask::ALT)));
    }
}
