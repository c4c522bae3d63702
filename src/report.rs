//! HID 输入报告的组装。
//!
//! 线缆格式（传输前缀 0xA1 = 主机方向输入报告）：
//! 键盘 10 字节 `A1 01 <修饰键> 00 <k1..k6>`，
//! 鼠标 6 字节 `A1 02 <按键位图> <dx> <dy> <滚轮>`。

use std::time::{Duration, Instant};

/// 全零键盘报告，让远端观察到所有按键已松开
pub const KEYBOARD_RELEASE: [u8; 10] = [0xA1, 0x01, 0, 0, 0, 0, 0, 0, 0, 0];
/// 全零鼠标报告
pub const MOUSE_RELEASE: [u8; 6] = [0xA1, 0x02, 0, 0, 0, 0];

/// 键盘输入报告：修饰字节 + 六个按键槽位
#[derive(Debug, Default, Clone)]
pub struct KeyboardReport {
    modifiers: u8,
    keys: [u8; 6],
}

impl KeyboardReport {
    pub fn modifiers(&self) -> u8 {
        self.modifiers
    }

    pub fn set_modifier(&mut self, bit: u8, pressed: bool) {
        if pressed {
            self.modifiers |= bit;
        } else {
            self.modifiers &= !bit;
        }
    }

    /// 六个槽位是否全空
    pub fn idle(&self) -> bool {
        self.keys.iter().all(|&k| k == 0)
    }

    /// 按下：写入第一个空槽，槽位占满则丢弃
    pub fn press(&mut self, usage: u8) {
        if let Some(slot) = self.keys.iter_mut().find(|k| **k == 0) {
            *slot = usage;
        }
    }

    /// 松开：清掉所有等于该用法码的槽位
    pub fn release(&mut self, usage: u8) {
        for slot in &mut self.keys {
            if *slot == usage {
                *slot = 0;
            }
        }
    }

    pub fn to_wire(&self) -> [u8; 10] {
        let mut wire = [0u8; 10];
        wire[0] = 0xA1;
        wire[1] = 0x01;
        wire[2] = self.modifiers;
        wire[4..].copy_from_slice(&self.keys);
        wire
    }
}

/// 鼠标输入报告：按键位图加两次发送之间的位移累积量
#[derive(Debug, Default)]
pub struct MouseReport {
    buttons: u8,
    x: i32,
    y: i32,
    wheel: i32,
    button_changed: bool,
    last_emit: Option<Instant>,
}

impl MouseReport {
    pub fn set_button(&mut self, bit: u8, pressed: bool) {
        if pressed {
            self.buttons |= bit;
        } else {
            self.buttons &= !bit;
        }
        self.button_changed = true;
    }

    pub fn add_x(&mut self, delta: i32) {
        self.x = self.x.saturating_add(delta);
    }

    pub fn add_y(&mut self, delta: i32) {
        self.y = self.y.saturating_add(delta);
    }

    pub fn add_wheel(&mut self, delta: i32) {
        self.wheel = self.wheel.saturating_add(delta);
    }

    /// 是否到了发送时机：按键变化必须立即发送，其余受限于节流间隔
    pub fn due(&self, delay: Duration, now: Instant) -> bool {
        if self.button_changed {
            return true;
        }
        match self.last_emit {
            Some(last) => now.duration_since(last) >= delay,
            None => true, // 首次必发
        }
    }

    /// 构建 6 字节报告并清零累积量
    pub fn build(&mut self, speed: f32, now: Instant) -> [u8; 6] {
        let wire = [
            0xA1,
            0x02,
            self.buttons,
            scale(self.x, speed) as u8,
            scale(self.y, speed) as u8,
            self.wheel.clamp(-127, 127) as i8 as u8,
        ];
        self.x = 0;
        self.y = 0;
        self.wheel = 0;
        self.button_changed = false;
        self.last_emit = Some(now);
        wire
    }
}

/// 位移乘以速度系数，向零截断后压入 [-127, 127]
fn scale(delta: i32, speed: f32) -> i8 {
    ((delta as f32 * speed) as i32).clamp(-127, 127) as i8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn press_takes_first_free_slot_and_release_clears_in_place() {
        let mut report = KeyboardReport::default();
        report.press(0x04);
        report.press(0x05);
        assert_eq!(report.to_wire(), [0xA1, 0x01, 0, 0, 0x04, 0x05, 0, 0, 0, 0]);

        report.release(0x04);
        assert_eq!(report.to_wire(), [0xA1, 0x01, 0, 0, 0, 0x05, 0, 0, 0, 0]);

        // 释放后空出的槽位被下一次按下复用
        report.press(0x06);
        assert_eq!(report.to_wire(), [0xA1, 0x01, 0, 0, 0x06, 0x05, 0, 0, 0, 0]);
    }

    #[test]
    fn seventh_key_is_dropped() {
        let mut report = KeyboardReport::default();
        for usage in 0x04..0x0A {
            report.press(usage);
        }
        report.press(0x0B);
        assert_eq!(
            report.to_wire()[4..],
            [0x04, 0x05, 0x06, 0x07, 0x08, 0x09]
        );
    }

    #[test]
    fn release_clears_every_matching_slot() {
        let mut report = KeyboardReport::default();
        report.press(0x04);
        report.press(0x04);
        report.release(0x04);
        assert!(report.idle());
    }

    #[test]
    fn modifier_bits_toggle() {
        let mut report = KeyboardReport::default();
        report.set_modifier(0x02, true);
        report.set_modifier(0x01, true);
        assert_eq!(report.modifiers(), 0x03);
        report.set_modifier(0x02, false);
        assert_eq!(report.modifiers(), 0x01);
    }

    #[test]
    fn mouse_build_scales_clamps_and_resets() {
        let now = Instant::now();
        let mut report = MouseReport::default();
        report.add_x(3);
        report.add_y(-4);
        report.add_wheel(200);
        assert_eq!(
            report.build(1.0, now),
            [0xA1, 0x02, 0, 3, (-4i8) as u8, 127]
        );
        // 累积量已清零
        assert_eq!(report.build(1.0, now), [0xA1, 0x02, 0, 0, 0, 0]);
    }

    #[test]
    fn mouse_speed_truncates_toward_zero() {
        let now = Instant::now();
        let mut report = MouseReport::default();
        report.add_x(3);
        report.add_y(-3);
        // 3 * 0.5 = 1.5 → 1；-3 * 0.5 = -1.5 → -1
        assert_eq!(report.build(0.5, now), [0xA1, 0x02, 0, 1, (-1i8) as u8, 0]);

        report.add_x(1000);
        assert_eq!(report.build(2.0, now)[3], 127);
    }

    #[test]
    fn rate_limiter_holds_until_delay_or_button_change() {
        let t0 = Instant::now();
        let delay = Duration::from_millis(20);
        let mut report = MouseReport::default();

        assert!(report.due(delay, t0)); // 首次必发
        report.build(1.0, t0);
        assert!(!report.due(delay, t0 + Duration::from_millis(5)));
        assert!(report.due(delay, t0 + Duration::from_millis(25)));

        report.build(1.0, t0 + Duration::from_millis(25));
        report.set_button(0x01, true);
        assert!(report.due(delay, t0 + Duration::from_millis(26)));
    }
}
