//! # TaskState — Durable Task Records
//!
//! One tagged union covers every record a resumable computation persists.
//! The discriminator byte is the on-disk record type; pattern matching on
//! the enum replaces per-record virtual dispatch.
//!
//! | Type | Variant          | Meaning                                   |
//! |------|------------------|-------------------------------------------|
//! | 1    | `Value`          | exact residue at an iteration             |
//! | 2    | `StrongCheck`    | mid-block X/D pair of a checked run       |
//! | 3    | `Product`        | intermediate proof product                |
//! | 4    | `Certificate`    | compressed Pietrzak certificate           |
//! | 5    | `Bare`           | recovery anchor, iteration only           |
//! | 7    | `LucasV`         | Lucas V at a chain stage (careful chain)  |
//! | 8    | `Serialized`     | residue kept in transform-friendly form   |
//! | 9    | `LucasVFast`     | Lucas V at a chain stage (fast chain)     |
//! | 10   | `LucasUV`        | Lucas V-pair with index parity            |
//! | 11   | `LucasUVCheck`   | mid-block Lucas UV X/D pair               |

use rug::Integer;

use crate::file::{Reader, Writer};
use crate::gw::SerializedGwNum;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Value {
        iteration: u32,
        x: Integer,
    },
    StrongCheck {
        iteration: u32,
        recovery: u32,
        x: SerializedGwNum,
        d: SerializedGwNum,
    },
    Product {
        iteration: u32,
        x: Integer,
    },
    Certificate {
        power: u32,
        x: Integer,
        a_power: Integer,
        a_base: Integer,
    },
    Bare {
        iteration: u32,
    },
    LucasV {
        iteration: u32,
        index: u32,
        v: Integer,
        parity: bool,
    },
    Serialized {
        iteration: u32,
        x: SerializedGwNum,
    },
    LucasVFast {
        iteration: u32,
        index: u32,
        v: Integer,
        parity: bool,
    },
    LucasUV {
        iteration: u32,
        u: Integer,
        v: Integer,
        parity: bool,
    },
    LucasUVCheck {
        iteration: u32,
        recovery: u32,
        xu: Integer,
        xv: Integer,
        xparity: bool,
        du: Integer,
        dv: Integer,
        dparity: bool,
    },
}

impl TaskState {
    pub fn type_byte(&self) -> u8 {
        match self {
            TaskState::Value { .. } => 1,
            TaskState::StrongCheck { .. } => 2,
            TaskState::Product { .. } => 3,
            TaskState::Certificate { .. } => 4,
            TaskState::Bare { .. } => 5,
            TaskState::LucasV { .. } => 7,
            TaskState::Serialized { .. } => 8,
            TaskState::LucasVFast { .. } => 9,
            TaskState::LucasUV { .. } => 10,
            TaskState::LucasUVCheck { .. } => 11,
        }
    }

    pub fn iteration(&self) -> u32 {
        match self {
            TaskState::Value { iteration, .. }
            | TaskState::StrongCheck { iteration, .. }
            | TaskState::Product { iteration, .. }
            | TaskState::Bare { iteration }
            | TaskState::LucasV { iteration, .. }
            | TaskState::Serialized { iteration, .. }
            | TaskState::LucasVFast { iteration, .. }
            | TaskState::LucasUV { iteration, .. }
            | TaskState::LucasUVCheck { iteration, .. } => *iteration,
            TaskState::Certificate { .. } => 0,
        }
    }

    /// The exact residue carried by the record, when it carries one.
    pub fn x(&self) -> Option<Integer> {
        match self {
            TaskState::Value { x, .. }
            | TaskState::Product { x, .. }
            | TaskState::Certificate { x, .. } => Some(x.clone()),
            TaskState::Serialized { x, .. } => Some(x.to_integer()),
            _ => None,
        }
    }

    pub fn write(&self, w: &mut Writer) {
        match self {
            TaskState::Value { iteration, x } => {
                w.write_u32(*iteration);
                w.write_giant(x);
            }
            TaskState::StrongCheck {
                iteration,
                recovery,
                x,
                d,
            } => {
                w.write_u32(*iteration);
                w.write_u32(*recovery);
                w.write_serialized(x);
                w.write_serialized(d);
            }
            TaskState::Product { iteration, x } => {
                w.write_u32(*iteration);
                w.write_giant(x);
            }
            TaskState::Certificate {
                power,
                x,
                a_power,
                a_base,
            } => {
                w.write_u32(*power);
                w.write_giant(x);
                w.write_giant(a_power);
                w.write_giant(a_base);
            }
            TaskState::Bare { iteration } => {
                w.write_u32(*iteration);
            }
            TaskState::LucasV {
                iteration,
                index,
                v,
                parity,
            }
            | TaskState::LucasVFast {
                iteration,
                index,
                v,
                parity,
            } => {
                w.write_u32(*iteration);
                w.write_u32(*index);
                w.write_giant(v);
                w.write_bool(*parity);
            }
            TaskState::Serialized { iteration, x } => {
                w.write_u32(*iteration);
                w.write_serialized(x);
            }
            TaskState::LucasUV {
                iteration,
                u,
                v,
                parity,
            } => {
                w.write_u32(*iteration);
                w.write_giant(u);
                w.write_giant(v);
                w.write_bool(*parity);
            }
            TaskState::LucasUVCheck {
                iteration,
                recovery,
                xu,
                xv,
                xparity,
                du,
                dv,
                dparity,
            } => {
                w.write_u32(*iteration);
                w.write_u32(*recovery);
                w.write_giant(xu);
                w.write_giant(xv);
                w.write_bool(*xparity);
                w.write_giant(du);
                w.write_giant(dv);
                w.write_bool(*dparity);
            }
        }
    }

    pub fn read(record_type: u8, r: &mut Reader) -> Option<TaskState> {
        Some(match record_type {
            1 => TaskState::Value {
                iteration: r.read_u32()?,
                x: r.read_giant()?,
            },
            2 => TaskState::StrongCheck {
                iteration: r.read_u32()?,
                recovery: r.read_u32()?,
                x: r.read_serialized()?,
                d: r.read_serialized()?,
            },
            3 => TaskState::Product {
                iteration: r.read_u32()?,
                x: r.read_giant()?,
            },
            4 => TaskState::Certificate {
                power: r.read_u32()?,
                x: r.read_giant()?,
                a_power: r.read_giant()?,
                a_base: r.read_giant()?,
            },
            5 => TaskState::Bare {
                iteration: r.read_u32()?,
            },
            7 => TaskState::LucasV {
                iteration: r.read_u32()?,
                index: r.read_u32()?,
                v: r.read_giant()?,
                parity: r.read_bool()?,
            },
            8 => TaskState::Serialized {
                iteration: r.read_u32()?,
                x: r.read_serialized()?,
            },
            9 => TaskState::LucasVFast {
                iteration: r.read_u32()?,
                index: r.read_u32()?,
                v: r.read_giant()?,
                parity: r.read_bool()?,
            },
            10 => TaskState::LucasUV {
                iteration: r.read_u32()?,
                u: r.read_giant()?,
                v: r.read_giant()?,
                parity: r.read_bool()?,
            },
            11 => TaskState::LucasUVCheck {
                iteration: r.read_u32()?,
                recovery: r.read_u32()?,
                xu: r.read_giant()?,
                xv: r.read_giant()?,
                xparity: r.read_bool()?,
                du: r.read_giant()?,
                dv: r.read_giant()?,
                dparity: r.read_bool()?,
            },
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(state: &TaskState) -> TaskState {
        let mut w = Writer::new();
        state.write(&mut w);
        let bytes = w.into_bytes();
        TaskState::read(state.type_byte(), &mut Reader::new(&bytes)).unwrap()
    }

    #[test]
    fn all_record_types_roundtrip() {
        let states = [
            TaskState::Value {
                iteration: 5,
                x: Integer::from(123u32),
            },
            TaskState::StrongCheck {
                iteration: 20,
                recovery: 16,
                x: SerializedGwNum::from_integer(&Integer::from(777u32)),
                d: SerializedGwNum::from_integer(&Integer::from(888u32)),
            },
            TaskState::Product {
                iteration: 2,
                x: Integer::from(31337u32),
            },
            TaskState::Certificate {
                power: 64,
                x: Integer::from(42u32),
                a_power: Integer::from(125u32),
                a_base: Integer::from(5u32),
            },
            TaskState::Bare { iteration: 100 },
            TaskState::LucasV {
                iteration: 3,
                index: 1,
                v: Integer::from(7u32),
                parity: true,
            },
            TaskState::Serialized {
                iteration: 9,
                x: SerializedGwNum::from_integer(&Integer::from(4444u32)),
            },
            TaskState::LucasVFast {
                iteration: 3,
                index: 2,
                v: Integer::from(11u32),
                parity: false,
            },
            TaskState::LucasUV {
                iteration: 8,
                u: Integer::from(13u32),
                v: Integer::from(17u32),
                parity: true,
            },
            TaskState::LucasUVCheck {
                iteration: 12,
                recovery: 8,
                xu: Integer::from(1u32),
                xv: Integer::from(2u32),
                xparity: false,
                du: Integer::from(3u32),
                dv: Integer::from(4u32),
                dparity: true,
            },
        ];
        for state in &states {
            assert_eq!(&roundtrip(state), state);
        }
    }

    #[test]
    fn discriminators_match_disk_format() {
        assert_eq!(
            TaskState::Value {
                iteration: 0,
                x: Integer::new()
            }
            .type_byte(),
            1
        );
        assert_eq!(TaskState::Bare { iteration: 0 }.type_byte(), 5);
        assert_eq!(
            TaskState::Serialized {
                iteration: 0,
                x: SerializedGwNum::default()
            }
            .type_byte(),
            8
        );
    }

    #[test]
    fn unknown_type_rejected() {
        let mut w = Writer::new();
        w.write_u32(1);
        let bytes = w.into_bytes();
        assert!(TaskState::read(6, &mut Reader::new(&bytes)).is_none());
        assert!(TaskState::read(99, &mut Reader::new(&bytes)).is_none());
    }

    #[test]
    fn truncated_record_rejected() {
        let state = TaskState::Value {
            iteration: 5,
            x: Integer::from(1u32) << 200,
        };
        let mut w = Writer::new();
        state.write(&mut w);
        let bytes = w.into_bytes();
        assert!(TaskState::read(1, &mut Reader::new(&bytes[..bytes.len() - 4])).is_none());
    }
}
