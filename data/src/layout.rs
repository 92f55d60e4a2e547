//! Symbolic tensor layouts.
//!
//! A layout names the axes of a tensor in storage order. A major axis is a
//! single uppercase letter; a lowercase letter denotes a blocked
//! sub-dimension of its uppercase counterpart and carries a block factor.
//! `NCHW16c` reads as `NCHW` with the channel axis split in blocks of 16,
//! `NCHW_c` as the same split with the block size left open.
//!
//! The reserved name `__undef__` stands for "no layout known". It parses,
//! serializes, and compares equal only to itself.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::internal::*;

const UNDEF: &str = "__undef__";
const UNIQUE_AXES: usize = 26;

/// Block factor carried by a minor axis.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BlockFactor {
    /// Written `_` in the layout string: the axis is blocked but the block
    /// size has not been decided yet.
    Unspecified,
    Fixed(u32),
}

/// A parsed layout expression.
///
/// Internally each of the 26 axis families keeps its major position, minor
/// position and block factor in flat arrays, so the by-letter probes and
/// [Layout::convertible] run in constant time whatever the rank is.
///
/// A layout is immutable once parsed, except for
/// [Layout::complete_axis_factor] which pins the unspecified factors.
#[derive(Clone)]
pub struct Layout {
    name: String,
    axes: TVec<char>,
    major_position: [i32; UNIQUE_AXES],
    minor_position: [i32; UNIQUE_AXES],
    // 0: no minor axis, -1: unspecified, >0: fixed block size
    minor_factor: [i64; UNIQUE_AXES],
}

impl Layout {
    pub fn is_major_axis(c: char) -> bool {
        c.is_ascii_uppercase()
    }

    pub fn is_minor_axis(c: char) -> bool {
        c.is_ascii_lowercase()
    }

    /// Uppercase representative of an axis family.
    pub fn to_major_axis(c: char) -> char {
        c.to_ascii_uppercase()
    }

    /// Lowercase representative of an axis family.
    pub fn to_minor_axis(c: char) -> char {
        c.to_ascii_lowercase()
    }

    /// The undefined layout.
    pub fn undef() -> Layout {
        Layout {
            name: UNDEF.to_string(),
            axes: tvec!(),
            major_position: [-1; UNIQUE_AXES],
            minor_position: [-1; UNIQUE_AXES],
            minor_factor: [0; UNIQUE_AXES],
        }
    }

    pub fn is_defined(&self) -> bool {
        self.name != UNDEF
    }

    /// Canonical name. `__undef__` for the undefined layout.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of axes, minor axes counted separately: `NCHW16c` has 5.
    pub fn ndim(&self) -> usize {
        self.axes.len()
    }

    /// Axis letters in storage order.
    pub fn axes(&self) -> &[char] {
        &self.axes
    }

    pub fn contains(&self, axis: char) -> bool {
        if Self::is_major_axis(axis) {
            self.major_position[family(axis)] >= 0
        } else if Self::is_minor_axis(axis) {
            self.minor_position[family(axis)] >= 0
        } else {
            false
        }
    }

    /// Position of the major axis of `c`'s family, whatever the case of `c`.
    pub fn pos_major(&self, c: char) -> Option<usize> {
        pos_of(&self.major_position, c)
    }

    /// Position of the minor axis of `c`'s family, whatever the case of `c`.
    pub fn pos_minor(&self, c: char) -> Option<usize> {
        pos_of(&self.minor_position, c)
    }

    /// Block factor of `c`'s family. `None` when the family has no minor
    /// axis here.
    pub fn factor(&self, c: char) -> Option<BlockFactor> {
        if !Self::is_major_axis(c) && !Self::is_minor_axis(c) {
            return None;
        }
        match self.minor_factor[family(c)] {
            0 => None,
            -1 => Some(BlockFactor::Unspecified),
            f => Some(BlockFactor::Fixed(f as u32)),
        }
    }

    /// Whether a tensor can be reinterpreted from `self` to `dst`: both
    /// defined and describing the same set of major axes. Block factors and
    /// axis order are free to differ.
    pub fn convertible(&self, dst: &Layout) -> bool {
        if !self.is_defined() || !dst.is_defined() {
            return false;
        }
        (0..UNIQUE_AXES)
            .all(|i| (self.major_position[i] >= 0) == (dst.major_position[i] >= 0))
    }

    /// Same axis letters in the same order, block factor values ignored.
    pub fn compatible(&self, other: &Layout) -> bool {
        self.is_defined() && other.is_defined() && self.axes == other.axes
    }

    /// Defined and without any unspecified block factor left.
    pub fn is_complete(&self) -> bool {
        self.is_defined() && self.minor_factor.iter().all(|&f| f >= 0)
    }

    /// Pin every unspecified block factor to `factor` and re-canonicalize
    /// the name. No-op on complete layouts and when `factor` is zero.
    pub fn complete_axis_factor(&mut self, factor: u32) {
        if factor == 0 || self.is_complete() || !self.is_defined() {
            return;
        }
        for f in self.minor_factor.iter_mut() {
            if *f == -1 {
                *f = factor as i64;
            }
        }
        self.name = (0..self.ndim()).map(|i| self.token(i)).collect();
    }

    /// The `len` axes starting at `pos`, factors preserved. Undefined when
    /// the range does not fit.
    pub fn sublayout(&self, pos: usize, len: usize) -> Layout {
        if !self.is_defined() || pos + len > self.ndim() || len == 0 {
            return Layout::undef();
        }
        let name: String = (pos..pos + len).map(|i| self.token(i)).collect();
        match name.parse() {
            Ok(layout) => layout,
            // a minor axis cut away from its major
            Err(_) => Layout::undef(),
        }
    }

    /// New layout with a minor axis of `axis`'s family, of block size
    /// `size`, inserted at position `pos`. `axis` must be a present major
    /// axis not split yet.
    pub fn split(&self, axis: char, pos: usize, size: u32) -> GraftResult<Layout> {
        ensure!(
            pos <= self.ndim(),
            DataError::Invariant {
                reason: format!("invalid split position {} for layout {}", pos, self)
            }
        );
        ensure!(
            Self::is_major_axis(axis),
            DataError::Invariant { reason: format!("cannot split minor axis {}", axis) }
        );
        ensure!(
            self.contains(axis),
            DataError::Invariant { reason: format!("axis {} does not exist in {}", axis, self) }
        );
        ensure!(
            !self.contains(Self::to_minor_axis(axis)),
            DataError::Invariant { reason: format!("axis {} already split in {}", axis, self) }
        );
        ensure!(
            size > 0,
            DataError::Invariant { reason: format!("invalid split size {}", size) }
        );
        let mut name = String::new();
        for i in 0..=self.ndim() {
            if i == pos {
                name.push_str(&format!("{}{}", size, Self::to_minor_axis(axis)));
            }
            if i == self.ndim() {
                break;
            }
            name.push_str(&self.token(i));
        }
        name.parse()
    }

    /// Textual concatenation followed by a re-parse, so duplicate axes are
    /// rejected.
    pub fn concat(&self, other: &Layout) -> GraftResult<Layout> {
        format!("{}{}", self.name, other.name).parse()
    }

    // canonical token for axis `i`: the letter, prefixed by its factor for
    // minor axes
    fn token(&self, i: usize) -> String {
        let c = self.axes[i];
        if Self::is_minor_axis(c) {
            match self.minor_factor[family(c)] {
                -1 => format!("_{}", c),
                f => format!("{}{}", f, c),
            }
        } else {
            c.to_string()
        }
    }

    fn parse(s: &str) -> GraftResult<Layout> {
        if s == UNDEF {
            return Ok(Layout::undef());
        }
        let fail = |reason: String| DataError::Parse { layout: s.to_string(), reason };
        let mut layout = Layout { name: String::new(), ..Layout::undef() };
        // pending block factor: 0 none, -1 unspecified, >0 digits so far
        let mut factor: i64 = 0;
        for c in s.chars() {
            if Self::is_major_axis(c) {
                let pos = family(c);
                ensure!(factor == 0, fail(format!("factor {} before major axis {}", factor, c)));
                ensure!(layout.major_position[pos] < 0, fail(format!("duplicate axis {}", c)));
                layout.major_position[pos] = layout.axes.len() as i32;
                layout.axes.push(c);
            } else if Self::is_minor_axis(c) {
                let pos = family(c);
                ensure!(
                    factor > 0 || factor == -1,
                    fail(format!("minor axis {} without a block factor", c))
                );
                ensure!(layout.minor_position[pos] < 0, fail(format!("duplicate axis {}", c)));
                ensure!(
                    layout.major_position[pos] >= 0,
                    fail(format!("minor axis {} without major axis {}", c, Self::to_major_axis(c)))
                );
                layout.minor_position[pos] = layout.axes.len() as i32;
                layout.minor_factor[pos] = factor;
                layout.axes.push(c);
                factor = 0;
            } else if c.is_ascii_digit() {
                ensure!(factor >= 0, fail("digit next to _".to_string()));
                factor = factor * 10 + (c as i64 - '0' as i64);
                ensure!(factor <= u32::MAX as i64, fail("block factor overflow".to_string()));
            } else if c == '_' {
                ensure!(factor == 0, fail("_ next to a digit or _".to_string()));
                factor = -1;
            } else {
                bail!(fail(format!("illegal character {:?}", c)));
            }
        }
        ensure!(factor == 0, fail("trailing block factor".to_string()));
        ensure!(!layout.axes.is_empty(), fail("empty layout".to_string()));
        layout.name = (0..layout.ndim()).map(|i| layout.token(i)).collect();
        Ok(layout)
    }
}

fn family(c: char) -> usize {
    (c.to_ascii_lowercase() as u8 - b'a') as usize
}

fn pos_of(positions: &[i32; UNIQUE_AXES], c: char) -> Option<usize> {
    if !Layout::is_major_axis(c) && !Layout::is_minor_axis(c) {
        return None;
    }
    match positions[family(c)] {
        p if p >= 0 => Some(p as usize),
        _ => None,
    }
}

impl Default for Layout {
    fn default() -> Layout {
        Layout::undef()
    }
}

impl FromStr for Layout {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> GraftResult<Layout> {
        Layout::parse(s)
    }
}

impl PartialEq for Layout {
    fn eq(&self, other: &Layout) -> bool {
        self.name == other.name
    }
}

impl Eq for Layout {}

impl Hash for Layout {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state)
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}", self.name)
    }
}

impl fmt::Debug for Layout {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}", self.name)
    }
}
