//! The fetch-decode-execute loop and the `Vm` that owns every piece of
//! engine state: memory, stack, PC, I/O-system mode, undo chain, random
//! source, and the accelerated-function table.

use std::collections::VecDeque;

use log::{debug, error, trace};

use crate::accel::AccelTable;
use crate::config::VmConfig;
use crate::decode::decode_opcode;
use crate::error::{VmError, VmErrorKind, VmResult};
use crate::float;
use crate::function::{self, FunctionHeader};
use crate::gestalt;
use crate::glk::{selector, GlkDispatcher, MemoryAccess};
use crate::memory::Memory;
use crate::operand::{decode_operands, OperandSlot, Role};
use crate::opcode as op;
use crate::random::Xoshiro128StarStar;
use crate::save::{Snapshot, UndoRing};
use crate::search;
use crate::stack::Stack;
use crate::strings::{self, stub_kind, BitCursor, IoSystem, Node};

/// What happened on the most recent `step`/`run` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Execution can continue.
    Continue,
    /// The program executed `quit` or its outermost function returned.
    Quit,
    /// `VmConfig::max_steps` was reached before the program finished.
    StepLimitReached,
}

fn read_be32(bytes: &[u8], pos: &mut usize) -> u32 {
    let v = u32::from_be_bytes([bytes[*pos], bytes[*pos + 1], bytes[*pos + 2], bytes[*pos + 3]]);
    *pos += 4;
    v
}

enum StringSource {
    Direct,
    Tree { root: u32, cursor: BitCursor },
}

struct StringFrame {
    pending: VecDeque<u32>,
    source: StringSource,
}

/// A `catch` site: the stack position to unwind to and where the thrown
/// value should be stored, mirroring the call-stub dest encoding.
#[derive(Debug, Clone, Copy)]
struct CatchPoint {
    sp: u32,
    fp: u32,
    pc: u32,
    dest_type: u32,
    dest_addr: u32,
}

pub struct Vm {
    memory: Memory,
    stack: Stack,
    pc: u32,
    io_system: IoSystem,
    string_table: u32,
    undo: UndoRing,
    rng: Xoshiro128StarStar,
    accel: AccelTable,
    config: VmConfig,
    string_frames: Vec<StringFrame>,
    catch_points: Vec<CatchPoint>,
    steps_taken: u64,
    /// Set by `branch()` when a jump resolves to the reserved 0/1 offsets,
    /// which mean "return this value from the current function" rather
    /// than an ordinary jump. Consumed at the end of `execute`.
    pending_return: Option<u32>,
}

impl Vm {
    /// Load a story file image and enter its start function.
    pub fn new(image: &[u8], config: VmConfig) -> VmResult<Self> {
        let memory = Memory::load(image)?;
        let mut stack = Stack::new(memory.header.stack_size);
        let header = FunctionHeader::parse(&memory, memory.header.start_func)
            .ok_or(VmError::at_load(VmErrorKind::BadImage))?;
        let pc = function::enter_function(&mut stack, &header, &[])?;

        let rng = match config.random_seed {
            Some(seed) => Xoshiro128StarStar::new(seed),
            None => Xoshiro128StarStar::from_entropy(),
        };

        debug!("vm started: start_func={:#x} entry_pc={:#x}", memory.header.start_func, pc);

        Ok(Self {
            string_table: memory.header.decoding_tbl,
            undo: UndoRing::new(config.undo_depth),
            memory,
            stack,
            pc,
            io_system: IoSystem::None,
            rng,
            accel: AccelTable::new(),
            config,
            string_frames: Vec::new(),
            catch_points: Vec::new(),
            steps_taken: 0,
            pending_return: None,
        })
    }

    #[must_use]
    pub fn pc(&self) -> u32 {
        self.pc
    }

    #[must_use]
    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    #[must_use]
    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    /// Register a native implementation for accelerated-function number
    /// `index`, so a later `accelfunc` binding a story-file address to
    /// that number dispatches to `f` instead of interpreting bytecode.
    /// A host does this once at startup, before running the image.
    pub fn register_accelerant(&mut self, index: u32, f: crate::accel::Accelerant) {
        self.accel.register(index, f);
    }

    /// Run until `quit`, a step-limit, or a fatal error.
    pub fn run(&mut self, glk: &mut dyn GlkDispatcher) -> VmResult<StepOutcome> {
        loop {
            match self.step(glk)? {
                StepOutcome::Continue => continue,
                other => return Ok(other),
            }
        }
    }

    /// Execute a single instruction.
    pub fn step(&mut self, glk: &mut dyn GlkDispatcher) -> VmResult<StepOutcome> {
        if let Some(max) = self.config.max_steps {
            if self.steps_taken >= max {
                return Ok(StepOutcome::StepLimitReached);
            }
        }
        self.steps_taken += 1;

        let prefix = [
            self.memory.read_byte(self.pc),
            self.memory.read_byte(self.pc.wrapping_add(1)),
            self.memory.read_byte(self.pc.wrapping_add(2)),
            self.memory.read_byte(self.pc.wrapping_add(3)),
        ];
        let (opcode, len) = decode_opcode(&prefix).ok_or_else(|| {
            let e = VmError::new(VmErrorKind::IllegalOpcode, self.pc);
            error!("{e}");
            e
        })?;
        self.pc += len as u32;

        self.execute(opcode, glk).inspect_err(|e| error!("{e}"))
    }

    fn roles_for(opcode: u32) -> VmResult<Vec<Role>> {
        use Role::{Load, Store};
        Ok(match opcode {
            op::NOP | op::STKSWAP | op::QUIT | op::RESTART | op::DISCARDUNDO => vec![],
            op::NEG | op::BITNOT | op::COPY | op::COPYS | op::COPYB | op::SEXS | op::SEXB => {
                vec![Load, Store]
            }
            op::ADD | op::SUB | op::MUL | op::DIV | op::MOD | op::BITAND | op::BITOR
            | op::BITXOR | op::SHIFTL | op::SSHIFTR | op::USHIFTR => vec![Load, Load, Store],
            op::JUMP | op::JUMPABS | op::MFREE | op::SETSTRINGTBL | op::SETRANDOM
            | op::STREAMCHAR | op::STREAMNUM | op::STREAMSTR | op::STREAMUNICHAR
            | op::STKCOPY => vec![Load],
            op::JZ | op::JNZ | op::SETIOSYS | op::STKROLL | op::ACCELFUNC => vec![Load, Load],
            op::STKPEEK | op::RANDOM | op::MALLOC => vec![Load, Store],
            op::JEQ | op::JNE | op::JLT | op::JGE | op::JGT | op::JLE | op::JLTU | op::JGEU
            | op::JGTU | op::JLEU | op::MCOPY | op::ACCELPARAM
            | op::ASTORE | op::ASTORES | op::ASTOREB | op::ASTOREBIT => vec![Load, Load, Load],
            op::PROTECT => vec![Load, Load],
            op::CALL | op::GESTALT | op::ALOAD | op::ALOADS | op::ALOADB | op::ALOADBIT => {
                vec![Load, Load, Store]
            }
            op::MZERO => vec![Load, Load],
            op::SETMEMSIZE => vec![Load, Store],
            op::TAILCALL => vec![Load, Load],
            op::GLK => vec![Load, Load, Store],
            op::RETURN => vec![Load],
            op::CATCH => vec![Store],
            op::THROW => vec![Load, Load],
            op::STKCOUNT | op::GETMEMSIZE | op::VERIFY | op::GETSTRINGTBL | op::SAVEUNDO
            | op::RESTOREUNDO | op::HASUNDO => vec![Store],
            op::SAVE | op::RESTORE => vec![Load, Store],
            op::GETIOSYS => vec![Store, Store],
            op::LINEARSEARCH | op::BINARYSEARCH => {
                vec![Load, Load, Load, Load, Load, Load, Load, Store]
            }
            op::LINKEDSEARCH => vec![Load, Load, Load, Load, Load, Load, Store],
            op::NUMTOF | op::FTONUMZ | op::FTONUMN | op::CEILF | op::FLOORF | op::SQRT
            | op::EXP | op::LOG | op::SIN | op::COS | op::TAN => vec![Load, Store],
            op::FADD | op::FSUB | op::FMUL | op::FDIV | op::FMOD | op::POW => {
                vec![Load, Load, Store]
            }
            op::JFLT | op::JFGT => vec![Load, Load, Load],
            op::JFEQ | op::JFNE => vec![Load, Load, Load, Load],
            op::JFISNAN => vec![Load, Load],
            op::NUMTOD => vec![Load, Store, Store],
            op::DTONUMZ | op::DTONUMN => vec![Load, Load, Store],
            op::DSQRT => vec![Load, Load, Store, Store],
            op::DADD | op::DSUB | op::DMUL | op::DDIV => {
                vec![Load, Load, Load, Load, Store, Store]
            }
            op::JDLT | op::JDGT => vec![Load, Load, Load, Load, Load],
            op::JDEQ | op::JDNE => vec![Load, Load, Load, Load, Load, Load, Load],
            op::JDISNAN => vec![Load, Load, Load],
            _ => return Err(VmError::new(VmErrorKind::IllegalOpcode, 0)),
        })
    }

    #[allow(clippy::too_many_lines)]
    fn execute(&mut self, opcode: u32, glk: &mut dyn GlkDispatcher) -> VmResult<StepOutcome> {
        let roles = Self::roles_for(opcode).map_err(|_| VmError::new(VmErrorKind::IllegalOpcode, self.pc))?;
        let mut pc = self.pc;
        let slots = decode_operands(&self.memory, &mut pc, &roles)?;
        self.pc = pc;

        macro_rules! l {
            ($i:expr) => {
                self.load(slots[$i])?
            };
        }
        macro_rules! s {
            ($i:expr, $v:expr) => {
                self.store(slots[$i], $v)?
            };
        }

        match opcode {
            op::NOP => {}
            op::ADD => s!(2, l!(0).wrapping_add(l!(1))),
            op::SUB => s!(2, l!(0).wrapping_sub(l!(1))),
            op::MUL => s!(2, l!(0).wrapping_mul(l!(1))),
            op::DIV => {
                let (a, b) = (l!(0) as i32, l!(1) as i32);
                if b == 0 || (a == i32::MIN && b == -1) {
                    return Err(VmError::new(VmErrorKind::DivideByZero, self.pc));
                }
                s!(2, (a / b) as u32);
            }
            op::MOD => {
                let (a, b) = (l!(0) as i32, l!(1) as i32);
                if b == 0 || (a == i32::MIN && b == -1) {
                    return Err(VmError::new(VmErrorKind::DivideByZero, self.pc));
                }
                s!(2, (a % b) as u32);
            }
            op::NEG => s!(1, (l!(0) as i32).wrapping_neg() as u32),
            op::BITAND => s!(2, l!(0) & l!(1)),
            op::BITOR => s!(2, l!(0) | l!(1)),
            op::BITXOR => s!(2, l!(0) ^ l!(1)),
            op::BITNOT => s!(1, !l!(0)),
            op::SHIFTL => {
                let (v, n) = (l!(0), l!(1));
                s!(2, if n >= 32 { 0 } else { v << n });
            }
            op::USHIFTR => {
                let (v, n) = (l!(0), l!(1));
                s!(2, if n >= 32 { 0 } else { v >> n });
            }
            op::SSHIFTR => {
                let (v, n) = (l!(0) as i32, l!(1));
                s!(2, if n >= 32 {
                    if v < 0 { 0xFFFF_FFFF } else { 0 }
                } else {
                    (v >> n.min(31)) as u32
                });
            }

            op::JUMP => self.branch(l!(0)),
            op::JZ => {
                let (v, off) = (l!(0), l!(1));
                if v == 0 {
                    self.branch(off);
                }
            }
            op::JNZ => {
                let (v, off) = (l!(0), l!(1));
                if v != 0 {
                    self.branch(off);
                }
            }
            op::JEQ => {
                let (a, b, off) = (l!(0), l!(1), l!(2));
                if a == b {
                    self.branch(off);
                }
            }
            op::JNE => {
                let (a, b, off) = (l!(0), l!(1), l!(2));
                if a != b {
                    self.branch(off);
                }
            }
            op::JLT => {
                let (a, b, off) = (l!(0) as i32, l!(1) as i32, l!(2));
                if a < b {
                    self.branch(off);
                }
            }
            op::JGE => {
                let (a, b, off) = (l!(0) as i32, l!(1) as i32, l!(2));
                if a >= b {
                    self.branch(off);
                }
            }
            op::JGT => {
                let (a, b, off) = (l!(0) as i32, l!(1) as i32, l!(2));
                if a > b {
                    self.branch(off);
                }
            }
            op::JLE => {
                let (a, b, off) = (l!(0) as i32, l!(1) as i32, l!(2));
                if a <= b {
                    self.branch(off);
                }
            }
            op::JLTU => {
                let (a, b, off) = (l!(0), l!(1), l!(2));
                if a < b {
                    self.branch(off);
                }
            }
            op::JGEU => {
                let (a, b, off) = (l!(0), l!(1), l!(2));
                if a >= b {
                    self.branch(off);
                }
            }
            op::JGTU => {
                let (a, b, off) = (l!(0), l!(1), l!(2));
                if a > b {
                    self.branch(off);
                }
            }
            op::JLEU => {
                let (a, b, off) = (l!(0), l!(1), l!(2));
                if a <= b {
                    self.branch(off);
                }
            }
            op::JUMPABS => self.pc = l!(0),

            op::CALL => {
                let (addr, argc) = (l!(0), l!(1));
                let args = self.pop_args(argc)?;
                let (dest_type, dest_addr) = Self::encode_dest(slots[2]);
                self.enter_call(addr, args, dest_type, dest_addr)?;
            }
            op::TAILCALL => {
                let (addr, argc) = (l!(0), l!(1));
                let args = self.pop_args(argc)?;
                self.stack.collapse_frame();
                let header = FunctionHeader::parse(&self.memory, addr)
                    .ok_or(VmError::new(VmErrorKind::IllegalOpcode, self.pc))?;
                self.pc = function::enter_function(&mut self.stack, &header, &args)?;
            }
            op::RETURN => {
                let value = l!(0);
                return self.do_return(glk, value);
            }
            op::CATCH => {
                let (dest_type, dest_addr) = Self::encode_dest(slots[0]);
                self.catch_points.push(CatchPoint {
                    sp: self.stack.sp(),
                    fp: self.stack.fp(),
                    pc: self.pc,
                    dest_type,
                    dest_addr,
                });
                s!(0, (self.catch_points.len() - 1) as u32);
            }
            op::THROW => {
                let (value, token) = (l!(0), l!(1));
                let point = *self
                    .catch_points
                    .get(token as usize)
                    .ok_or(VmError::new(VmErrorKind::BadCallStub, self.pc))?;
                self.stack.set_sp(point.sp);
                self.stack.set_fp(point.fp);
                self.store_via_dest(point.dest_type, point.dest_addr, value)?;
                self.pc = point.pc;
            }

            op::COPY => s!(1, l!(0)),
            op::COPYS => {
                let v = self.load_sized(slots[0], 2)?;
                self.store_sized(slots[1], 2, v)?;
            }
            op::COPYB => {
                let v = self.load_sized(slots[0], 1)?;
                self.store_sized(slots[1], 1, v)?;
            }
            op::SEXS => s!(1, i32::from(l!(0) as u16 as i16) as u32),
            op::SEXB => s!(1, i32::from(l!(0) as u8 as i8) as u32),

            op::ALOAD => {
                let (base, idx) = (l!(0), l!(1));
                s!(2, self.memory.read_word(base.wrapping_add((idx as i32 as u32).wrapping_mul(4))));
            }
            op::ALOADS => {
                let (base, idx) = (l!(0), l!(1));
                s!(2, u32::from(self.memory.read_short(base.wrapping_add((idx as i32 as u32).wrapping_mul(2)))));
            }
            op::ALOADB => {
                let (base, idx) = (l!(0), l!(1));
                s!(2, u32::from(self.memory.read_byte(base.wrapping_add(idx as i32 as u32))));
            }
            op::ALOADBIT => {
                let (base, bit) = (l!(0) as i64, l!(1) as i32 as i64);
                let byte_addr = (base + bit.div_euclid(8)) as u32;
                let bit_pos = bit.rem_euclid(8) as u32;
                let b = self.memory.read_byte(byte_addr);
                s!(2, u32::from((b >> bit_pos) & 1));
            }
            op::ASTORE => {
                let (base, idx, value) = (l!(0), l!(1), l!(2));
                self.memory.write_word(base.wrapping_add((idx as i32 as u32).wrapping_mul(4)), value);
            }
            op::ASTORES => {
                let (base, idx, value) = (l!(0), l!(1), l!(2));
                self.memory.write_short(base.wrapping_add((idx as i32 as u32).wrapping_mul(2)), value as u16);
            }
            op::ASTOREB => {
                let (base, idx, value) = (l!(0), l!(1), l!(2));
                self.memory.write_byte(base.wrapping_add(idx as i32 as u32), value as u8);
            }
            op::ASTOREBIT => {
                let (base, bit, value) = (l!(0) as i64, l!(1) as i32 as i64, l!(2));
                let byte_addr = (base + bit.div_euclid(8)) as u32;
                let bit_pos = bit.rem_euclid(8) as u32;
                let mut b = self.memory.read_byte(byte_addr);
                if value & 1 != 0 {
                    b |= 1 << bit_pos;
                } else {
                    b &= !(1 << bit_pos);
                }
                self.memory.write_byte(byte_addr, b);
            }

            op::STKCOUNT => s!(0, self.stack.count()),
            op::STKPEEK => {
                let depth = l!(0);
                let v = self.stack.peek_u32(depth)?;
                s!(1, v);
            }
            op::STKSWAP => self.stack.swap()?,
            op::STKROLL => {
                let (n, shift) = (l!(0), l!(1) as i32);
                self.stack.roll(n, shift)?;
            }
            op::STKCOPY => {
                let n = l!(0);
                self.stack.copy_top(n)?;
            }

            op::STREAMCHAR => {
                let ch = l!(0) & 0xFF;
                self.begin_stream(vec![ch], glk)?;
            }
            op::STREAMUNICHAR => {
                let ch = l!(0);
                self.begin_stream(vec![ch], glk)?;
            }
            op::STREAMNUM => {
                let value = l!(0) as i32;
                let digits = strings::format_decimal(value).into_iter().map(u32::from).collect();
                self.begin_stream(digits, glk)?;
            }
            op::STREAMSTR => {
                let addr = l!(0);
                self.begin_string_at(addr, glk)?;
            }

            op::GESTALT => {
                let (selector_id, arg) = (l!(0), l!(1));
                let heap_start = self.memory.heap_start();
                let accel = &self.accel;
                let result = gestalt::query(glk, selector_id, arg, heap_start, |addr| accel.is_installed(addr));
                s!(2, result);
            }
            op::GETMEMSIZE => s!(0, self.memory.size()),
            op::SETMEMSIZE => {
                let new_size = l!(0);
                let ok = self.memory.set_size(new_size);
                s!(1, u32::from(!ok));
            }
            op::MZERO => {
                let (addr, len) = (l!(0), l!(1));
                self.memory.zero(addr, len);
            }
            op::MCOPY => {
                let (src, dest, len) = (l!(0), l!(1), l!(2));
                self.memory.copy(src, dest, len);
            }
            op::MALLOC => {
                let len = l!(0);
                let addr = self.memory.malloc(len);
                s!(1, addr);
            }
            op::MFREE => {
                let addr = l!(0);
                self.memory.free(addr);
            }
            op::PROTECT => {
                let (start, len) = (l!(0), l!(1));
                self.memory.protect(start, len);
            }

            op::RANDOM => {
                let l1 = l!(0) as i32;
                let raw = self.rng.next_u32();
                let value = match l1.cmp(&0) {
                    std::cmp::Ordering::Equal => raw,
                    std::cmp::Ordering::Greater => raw % (l1 as u32),
                    std::cmp::Ordering::Less => (raw % (l1.unsigned_abs())).wrapping_neg(),
                };
                s!(1, value);
            }
            op::SETRANDOM => {
                let seed = l!(0);
                self.rng = if seed == 0 {
                    Xoshiro128StarStar::from_entropy()
                } else {
                    Xoshiro128StarStar::new([seed, seed, seed, seed])
                };
            }

            op::QUIT => return Ok(StepOutcome::Quit),
            op::VERIFY => s!(0, 0),
            op::RESTART => {
                self.memory.restart();
                let header = FunctionHeader::parse(&self.memory, self.memory.header.start_func)
                    .ok_or(VmError::new(VmErrorKind::BadImage, self.pc))?;
                self.stack = Stack::new(self.memory.header.stack_size);
                self.pc = function::enter_function(&mut self.stack, &header, &[])?;
                self.io_system = IoSystem::None;
                self.string_frames.clear();
                self.catch_points.clear();
            }
            op::GETSTRINGTBL => s!(0, self.string_table),
            op::SETSTRINGTBL => self.string_table = l!(0),

            op::GLK => {
                let (selector_id, argc) = (l!(0), l!(1));
                let args = self.pop_args(argc)?;
                let result = glk.call(selector_id, &args, MemoryAccess::new(&mut self.memory));
                s!(2, result);
            }
            op::GETIOSYS => {
                s!(0, self.io_system.mode());
                s!(1, self.io_system.rock());
            }
            op::SETIOSYS => {
                let (mode, rock) = (l!(0), l!(1));
                self.io_system = IoSystem::from_mode(mode, rock);
            }

            op::SAVE => {
                let stream_id = l!(0);
                let pc_after = self.pc;
                let (dest_type, dest_addr) = (0u32, 0u32);
                let snap = Snapshot::capture(
                    &self.memory,
                    &self.stack,
                    pc_after,
                    dest_type,
                    dest_addr,
                    self.encode_string_frames(),
                    self.encode_catch_points(),
                );
                let bytes = snap.to_bytes();
                let addr = self.memory.malloc(bytes.len() as u32);
                for (i, &b) in bytes.iter().enumerate() {
                    self.memory.write_byte(addr + i as u32, b);
                }
                let ok = glk.call(
                    selector::SAVE_STREAM,
                    &[stream_id, addr, bytes.len() as u32],
                    MemoryAccess::new(&mut self.memory),
                );
                self.memory.free(addr);
                s!(1, u32::from(ok == 0));
            }
            op::RESTORE => {
                let stream_id = l!(0);
                let cap = self.memory.size();
                let addr = self.memory.malloc(cap);
                let read = glk.call(
                    selector::RESTORE_STREAM,
                    &[stream_id, addr, cap],
                    MemoryAccess::new(&mut self.memory),
                );
                let mut ok = false;
                if read > 0 {
                    let bytes: Vec<u8> = (0..read).map(|i| self.memory.read_byte(addr + i)).collect();
                    if let Some(snap) = Snapshot::from_bytes(&bytes) {
                        self.pc = snap.apply(&mut self.memory, &mut self.stack);
                        self.string_frames = Self::decode_string_frames(&snap.string_frames);
                        self.catch_points = Self::decode_catch_points(&snap.catch_points);
                        ok = true;
                    }
                }
                self.memory.free(addr);
                s!(1, u32::from(!ok));
            }
            op::SAVEUNDO => {
                let (dest_type, dest_addr) = Self::encode_dest(slots[0]);
                let snap = Snapshot::capture(
                    &self.memory,
                    &self.stack,
                    self.pc,
                    dest_type,
                    dest_addr,
                    self.encode_string_frames(),
                    self.encode_catch_points(),
                );
                self.undo.push(snap);
                trace!("saveundo: {} snapshot(s) retained", self.undo.len());
                s!(0, 0);
            }
            op::RESTOREUNDO => match self.undo.pop() {
                Some(snap) => {
                    let (dest_type, dest_addr) = (snap.dest_type, snap.dest_addr);
                    let pc = snap.apply(&mut self.memory, &mut self.stack);
                    self.string_frames = Self::decode_string_frames(&snap.string_frames);
                    self.catch_points = Self::decode_catch_points(&snap.catch_points);
                    self.store_via_dest(dest_type, dest_addr, 0xFFFF_FFFF)?;
                    self.pc = pc;
                }
                None => s!(0, 1),
            },
            op::HASUNDO => s!(0, u32::from(self.undo.has_undo())),
            op::DISCARDUNDO => self.undo.discard(),

            op::LINEARSEARCH => {
                let (key, key_size, structure, struct_size, num, key_off, options) =
                    (l!(0), l!(1) as u8, l!(2), l!(3), l!(4), l!(5), l!(6));
                let found = search::linear_search(&self.memory, key, key_size, structure, struct_size, num, key_off, options);
                s!(7, self.search_result(found, options));
            }
            op::BINARYSEARCH => {
                let (key, key_size, structure, struct_size, num, key_off, options) =
                    (l!(0), l!(1) as u8, l!(2), l!(3), l!(4), l!(5), l!(6));
                let found = search::binary_search(&self.memory, key, key_size, structure, struct_size, num, key_off, options);
                s!(7, self.search_result(found, options));
            }
            op::LINKEDSEARCH => {
                let (key, key_size, start, key_off, next_off, options) =
                    (l!(0), l!(1) as u8, l!(2), l!(3), l!(4), l!(5));
                let found = search::linked_search(&self.memory, key, key_size, start, key_off, next_off, options);
                s!(6, found.unwrap_or(0));
            }

            op::ACCELFUNC => {
                let (index, addr) = (l!(0), l!(1));
                self.accel.install(index, addr);
            }
            op::ACCELPARAM => {
                let (index, slot, value) = (l!(0), l!(1), l!(2));
                self.accel.set_param(index, slot, value);
            }

            op::NUMTOF => s!(1, float::f32_to_bits(l!(0) as i32 as f32)),
            op::FTONUMZ => s!(1, float::f32_to_i32_trunc(float::bits_to_f32(l!(0))) as u32),
            op::FTONUMN => s!(1, float::f32_to_i32_round(float::bits_to_f32(l!(0))) as u32),
            op::CEILF => s!(1, float::f32_to_bits(float::bits_to_f32(l!(0)).ceil())),
            op::FLOORF => s!(1, float::f32_to_bits(float::bits_to_f32(l!(0)).floor())),
            op::FADD => self.f32_binop(&slots, |a, b| a + b)?,
            op::FSUB => self.f32_binop(&slots, |a, b| a - b)?,
            op::FMUL => self.f32_binop(&slots, |a, b| a * b)?,
            op::FDIV => self.f32_binop(&slots, |a, b| a / b)?,
            op::FMOD => self.f32_binop(&slots, |a, b| a % b)?,
            op::SQRT => s!(1, float::f32_to_bits(float::bits_to_f32(l!(0)).sqrt())),
            op::EXP => s!(1, float::f32_to_bits(float::bits_to_f32(l!(0)).exp())),
            op::LOG => s!(1, float::f32_to_bits(float::bits_to_f32(l!(0)).ln())),
            op::POW => self.f32_binop(&slots, f32::powf)?,
            op::SIN => s!(1, float::f32_to_bits(float::bits_to_f32(l!(0)).sin())),
            op::COS => s!(1, float::f32_to_bits(float::bits_to_f32(l!(0)).cos())),
            op::TAN => s!(1, float::f32_to_bits(float::bits_to_f32(l!(0)).tan())),
            op::JFEQ => {
                let (a, b, tol, off) = (
                    float::bits_to_f32(l!(0)),
                    float::bits_to_f32(l!(1)),
                    float::bits_to_f32(l!(2)),
                    l!(3),
                );
                if float::float_eq_within(a, b, tol) {
                    self.branch(off);
                }
            }
            op::JFNE => {
                let (a, b, tol, off) = (
                    float::bits_to_f32(l!(0)),
                    float::bits_to_f32(l!(1)),
                    float::bits_to_f32(l!(2)),
                    l!(3),
                );
                if !float::float_eq_within(a, b, tol) {
                    self.branch(off);
                }
            }
            op::JFLT => {
                let (a, b, off) = (float::bits_to_f32(l!(0)), float::bits_to_f32(l!(1)), l!(2));
                if a < b {
                    self.branch(off);
                }
            }
            op::JFGT => {
                let (a, b, off) = (float::bits_to_f32(l!(0)), float::bits_to_f32(l!(1)), l!(2));
                if a > b {
                    self.branch(off);
                }
            }
            op::JFISNAN => {
                let (a, off) = (float::bits_to_f32(l!(0)), l!(1));
                if a.is_nan() {
                    self.branch(off);
                }
            }

            op::NUMTOD => {
                let (hi, lo) = float::f64_to_words(f64::from(l!(0) as i32));
                s!(1, hi);
                s!(2, lo);
            }
            op::DTONUMZ => s!(2, float::f64_to_i32_trunc(float::words_to_f64(l!(0), l!(1))) as u32),
            op::DTONUMN => s!(2, float::f64_to_i32_round(float::words_to_f64(l!(0), l!(1))) as u32),
            op::DSQRT => {
                let v = float::words_to_f64(l!(0), l!(1)).sqrt();
                let (hi, lo) = float::f64_to_words(v);
                s!(2, hi);
                s!(3, lo);
            }
            op::DADD => self.f64_binop(&slots, |a, b| a + b)?,
            op::DSUB => self.f64_binop(&slots, |a, b| a - b)?,
            op::DMUL => self.f64_binop(&slots, |a, b| a * b)?,
            op::DDIV => self.f64_binop(&slots, |a, b| a / b)?,
            op::JDEQ => {
                let (a, b, tol, off) = (
                    float::words_to_f64(l!(0), l!(1)),
                    float::words_to_f64(l!(2), l!(3)),
                    float::words_to_f64(l!(4), l!(5)),
                    l!(6),
                );
                if float::double_eq_within(a, b, tol) {
                    self.branch(off);
                }
            }
            op::JDNE => {
                let (a, b, tol, off) = (
                    float::words_to_f64(l!(0), l!(1)),
                    float::words_to_f64(l!(2), l!(3)),
                    float::words_to_f64(l!(4), l!(5)),
                    l!(6),
                );
                if !float::double_eq_within(a, b, tol) {
                    self.branch(off);
                }
            }
            op::JDLT => {
                let (a, b, off) = (
                    float::words_to_f64(l!(0), l!(1)),
                    float::words_to_f64(l!(2), l!(3)),
                    l!(4),
                );
                if a < b {
                    self.branch(off);
                }
            }
            op::JDGT => {
                let (a, b, off) = (
                    float::words_to_f64(l!(0), l!(1)),
                    float::words_to_f64(l!(2), l!(3)),
                    l!(4),
                );
                if a > b {
                    self.branch(off);
                }
            }
            op::JDISNAN => {
                let (a, off) = (float::words_to_f64(l!(0), l!(1)), l!(2));
                if a.is_nan() {
                    self.branch(off);
                }
            }

            _ => return Err(VmError::new(VmErrorKind::IllegalOpcode, self.pc)),
        }
        if let Some(value) = self.pending_return.take() {
            return self.do_return(glk, value);
        }
        Ok(StepOutcome::Continue)
    }

    /// Take a branch by `offset` (already sign-extended by the caller via
    /// a signed operand load). Offsets 0 and 1 are the reserved
    /// "return 0"/"return 1" forms; every other offset is relative to the
    /// branch instruction's own end, biased by -2 per §4.4.
    fn branch(&mut self, offset: u32) {
        match offset as i32 {
            0 => self.pending_return = Some(0),
            1 => self.pending_return = Some(1),
            off => self.pc = (i64::from(self.pc) + i64::from(off) - 2) as u32,
        }
    }

    // ---- operand load/store ----

    fn load(&mut self, slot: OperandSlot) -> VmResult<u32> {
        match slot {
            OperandSlot::Const(v) => Ok(v),
            OperandSlot::Mem(addr) => Ok(self.memory.read_word(addr)),
            OperandSlot::Local(offset) => {
                let (addr, width) = self.stack.local_addr_and_width(offset);
                Ok(self.read_local(addr, width))
            }
            OperandSlot::Stack => self.stack.pop_u32(),
            OperandSlot::Discard => Ok(0),
        }
    }

    fn store(&mut self, slot: OperandSlot, value: u32) -> VmResult<()> {
        match slot {
            OperandSlot::Discard | OperandSlot::Const(_) => Ok(()),
            OperandSlot::Mem(addr) => {
                self.memory.write_word(addr, value);
                Ok(())
            }
            OperandSlot::Local(offset) => {
                let (addr, width) = self.stack.local_addr_and_width(offset);
                self.write_local(addr, width, value);
                Ok(())
            }
            OperandSlot::Stack => self.stack.push_u32(value),
        }
    }

    fn load_sized(&mut self, slot: OperandSlot, width: u8) -> VmResult<u32> {
        if let OperandSlot::Mem(addr) = slot {
            return Ok(match width {
                1 => u32::from(self.memory.read_byte(addr)),
                2 => u32::from(self.memory.read_short(addr)),
                _ => self.memory.read_word(addr),
            });
        }
        self.load(slot)
    }

    fn store_sized(&mut self, slot: OperandSlot, width: u8, value: u32) -> VmResult<()> {
        if let OperandSlot::Mem(addr) = slot {
            match width {
                1 => self.memory.write_byte(addr, value as u8),
                2 => self.memory.write_short(addr, value as u16),
                _ => self.memory.write_word(addr, value),
            }
            return Ok(());
        }
        self.store(slot, value)
    }

    fn read_local(&self, addr: u32, width: u8) -> u32 {
        match width {
            1 => u32::from(self.stack.read_byte(addr)),
            2 => u32::from(self.stack.read_short(addr)),
            _ => self.stack.read_word(addr),
        }
    }

    fn write_local(&mut self, addr: u32, width: u8, value: u32) {
        match width {
            1 => self.stack.write_byte(addr, value as u8),
            2 => self.stack.write_short(addr, value as u16),
            _ => self.stack.write_word(addr, value),
        }
    }

    /// Encode an operand slot as a 16-byte call-stub destination, as used
    /// by `call`/`catch`/`saveundo`.
    fn encode_dest(slot: OperandSlot) -> (u32, u32) {
        match slot {
            OperandSlot::Discard | OperandSlot::Const(_) => (0, 0),
            OperandSlot::Mem(addr) => (1, addr),
            OperandSlot::Local(offset) => (2, offset),
            OperandSlot::Stack => (3, 0),
        }
    }

    /// Encode the in-progress string-output frames so a `Snapshot` can
    /// carry them. This state lives off the VM stack (in `self`, not
    /// `self.stack`), so `Snapshot::capture`/`apply` can't reach it on
    /// their own — the caller hands over an opaque blob.
    fn encode_string_frames(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.string_frames.len() as u32).to_be_bytes());
        for frame in &self.string_frames {
            match frame.source {
                StringSource::Direct => out.push(0),
                StringSource::Tree { root, cursor } => {
                    out.push(1);
                    out.extend_from_slice(&root.to_be_bytes());
                    out.extend_from_slice(&cursor.addr().to_be_bytes());
                    out.push(cursor.bit_offset());
                }
            }
            out.extend_from_slice(&(frame.pending.len() as u32).to_be_bytes());
            for &v in &frame.pending {
                out.extend_from_slice(&v.to_be_bytes());
            }
        }
        out
    }

    fn decode_string_frames(bytes: &[u8]) -> Vec<StringFrame> {
        if bytes.len() < 4 {
            return Vec::new();
        }
        let mut pos = 0usize;
        let count = read_be32(bytes, &mut pos);
        let mut frames = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let tag = bytes[pos];
            pos += 1;
            let source = if tag == 1 {
                let root = read_be32(bytes, &mut pos);
                let addr = read_be32(bytes, &mut pos);
                let bit = bytes[pos];
                pos += 1;
                StringSource::Tree { root, cursor: BitCursor::at(addr, bit) }
            } else {
                StringSource::Direct
            };
            let pending_len = read_be32(bytes, &mut pos);
            let mut pending = VecDeque::with_capacity(pending_len as usize);
            for _ in 0..pending_len {
                pending.push_back(read_be32(bytes, &mut pos));
            }
            frames.push(StringFrame { pending, source });
        }
        frames
    }

    /// Encode open `catch` points the same way: they reference stack
    /// positions by value, not by holding a borrow, so they survive a
    /// stack replace/restore as plain data.
    fn encode_catch_points(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.catch_points.len() as u32).to_be_bytes());
        for cp in &self.catch_points {
            out.extend_from_slice(&cp.sp.to_be_bytes());
            out.extend_from_slice(&cp.fp.to_be_bytes());
            out.extend_from_slice(&cp.pc.to_be_bytes());
            out.extend_from_slice(&cp.dest_type.to_be_bytes());
            out.extend_from_slice(&cp.dest_addr.to_be_bytes());
        }
        out
    }

    fn decode_catch_points(bytes: &[u8]) -> Vec<CatchPoint> {
        if bytes.len() < 4 {
            return Vec::new();
        }
        let mut pos = 0usize;
        let count = read_be32(bytes, &mut pos);
        let mut points = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let sp = read_be32(bytes, &mut pos);
            let fp = read_be32(bytes, &mut pos);
            let pc = read_be32(bytes, &mut pos);
            let dest_type = read_be32(bytes, &mut pos);
            let dest_addr = read_be32(bytes, &mut pos);
            points.push(CatchPoint { sp, fp, pc, dest_type, dest_addr });
        }
        points
    }

    fn store_via_dest(&mut self, dest_type: u32, dest_addr: u32, value: u32) -> VmResult<()> {
        match dest_type {
            0 => Ok(()),
            1 => {
                self.memory.write_word(dest_addr, value);
                Ok(())
            }
            2 => {
                let (addr, width) = self.stack.local_addr_and_width(dest_addr);
                self.write_local(addr, width, value);
                Ok(())
            }
            3 => self.stack.push_u32(value),
            _ => Err(VmError::new(VmErrorKind::BadCallStub, self.pc)),
        }
    }

    fn pop_args(&mut self, argc: u32) -> VmResult<Vec<u32>> {
        let mut args = Vec::with_capacity(argc as usize);
        for _ in 0..argc {
            args.push(self.stack.pop_u32()?);
        }
        args.reverse();
        Ok(args)
    }

    fn enter_call(&mut self, addr: u32, args: Vec<u32>, dest_type: u32, dest_addr: u32) -> VmResult<()> {
        if let Some(result) = self.accel.call(addr, &args) {
            return self.store_via_dest(dest_type, dest_addr, result);
        }
        let header = FunctionHeader::parse(&self.memory, addr)
            .ok_or(VmError::new(VmErrorKind::IllegalOpcode, self.pc))?;
        self.stack.push_call_stub(dest_type, dest_addr, self.pc, self.stack.fp())?;
        self.pc = function::enter_function(&mut self.stack, &header, &args)?;
        Ok(())
    }

    fn do_return(&mut self, glk: &mut dyn GlkDispatcher, value: u32) -> VmResult<StepOutcome> {
        self.stack.collapse_frame();
        if self.stack.sp() == 0 {
            return Ok(StepOutcome::Quit);
        }
        let (dest_type, dest_addr, ret_pc, ret_fp) = self.stack.pop_call_stub()?;
        self.stack.set_fp(ret_fp);
        if dest_type == stub_kind::STRING_RESUME {
            self.advance_string(glk)?;
            return Ok(StepOutcome::Continue);
        }
        self.store_via_dest(dest_type, dest_addr, value)?;
        self.pc = ret_pc;
        Ok(StepOutcome::Continue)
    }

    fn f32_binop(&mut self, slots: &[OperandSlot], f: impl Fn(f32, f32) -> f32) -> VmResult<()> {
        let a = float::bits_to_f32(self.load(slots[0])?);
        let b = float::bits_to_f32(self.load(slots[1])?);
        self.store(slots[2], float::f32_to_bits(f(a, b)))
    }

    fn f64_binop(&mut self, slots: &[OperandSlot], f: impl Fn(f64, f64) -> f64) -> VmResult<()> {
        let a = float::words_to_f64(self.load(slots[0])?, self.load(slots[1])?);
        let b = float::words_to_f64(self.load(slots[2])?, self.load(slots[3])?);
        let (hi, lo) = float::f64_to_words(f(a, b));
        self.store(slots[4], hi)?;
        self.store(slots[5], lo)
    }

    fn search_result(&self, found: Option<u32>, options: u32) -> u32 {
        match found {
            Some(v) => v,
            None if options & search::OPT_RETURN_INDEX != 0 => 0xFFFF_FFFF,
            None => 0,
        }
    }

    // ---- string output ----

    fn begin_stream(&mut self, values: Vec<u32>, glk: &mut dyn GlkDispatcher) -> VmResult<()> {
        self.stack
            .push_call_stub(stub_kind::STRING_TERMINATOR, 0, self.pc, self.stack.fp())?;
        self.string_frames.push(StringFrame {
            pending: values.into(),
            source: StringSource::Direct,
        });
        self.advance_string(glk)
    }

    fn begin_string_at(&mut self, addr: u32, glk: &mut dyn GlkDispatcher) -> VmResult<()> {
        let tag = self.memory.read_byte(addr);
        let frame = match tag {
            0xE0 => StringFrame {
                pending: strings::read_e0_bytes(&self.memory, addr + 1)
                    .into_iter()
                    .map(u32::from)
                    .collect(),
                source: StringSource::Direct,
            },
            0xE2 => StringFrame {
                pending: strings::read_e2_words(&self.memory, addr + 4).into(),
                source: StringSource::Direct,
            },
            0xE1 => StringFrame {
                pending: VecDeque::new(),
                source: StringSource::Tree {
                    root: strings::table_root(&self.memory, self.string_table),
                    cursor: BitCursor::new(addr + 1),
                },
            },
            other => {
                log::warn!("streamstr: unrecognised string tag {other:#x} at {addr:#x}");
                StringFrame {
                    pending: VecDeque::new(),
                    source: StringSource::Direct,
                }
            }
        };
        self.stack
            .push_call_stub(stub_kind::STRING_TERMINATOR, 0, self.pc, self.stack.fp())?;
        self.string_frames.push(frame);
        self.advance_string(glk)
    }

    fn advance_string(&mut self, glk: &mut dyn GlkDispatcher) -> VmResult<()> {
        loop {
            let next = self
                .string_frames
                .last_mut()
                .expect("advance_string called with no active frame")
                .pending
                .pop_front();
            if let Some(ch) = next {
                if self.emit_char_or_suspend(ch, glk)? {
                    return Ok(());
                }
                continue;
            }

            let is_direct = matches!(
                self.string_frames.last().expect("frame present").source,
                StringSource::Direct
            );
            if is_direct {
                self.finish_string();
                return Ok(());
            }

            let node = {
                let frame = self.string_frames.last_mut().expect("frame present");
                let StringSource::Tree { root, cursor } = &mut frame.source else {
                    unreachable!("non-direct source is always Tree")
                };
                strings::walk_to_leaf(&self.memory, *root, cursor)
            };

            match node {
                Node::Terminator => {
                    self.finish_string();
                    return Ok(());
                }
                Node::Byte(b) => self.push_pending(u32::from(b)),
                Node::ByteString(bytes) => {
                    for b in bytes {
                        self.push_pending(u32::from(b));
                    }
                }
                Node::Unicode(cp) => self.push_pending(cp),
                Node::UnicodeString(words) => {
                    for w in words {
                        self.push_pending(w);
                    }
                }
                Node::IndirectCall { addr } => {
                    if self.suspend_for_call(addr, vec![])? {
                        return Ok(());
                    }
                }
                Node::DoubleIndirectCall { addr_of_addr } => {
                    let addr = self.memory.read_word(addr_of_addr);
                    if self.suspend_for_call(addr, vec![])? {
                        return Ok(());
                    }
                }
                Node::IndirectCallArgs { addr, args } => {
                    if self.suspend_for_call(addr, args)? {
                        return Ok(());
                    }
                }
                Node::DoubleIndirectCallArgs { addr_of_addr, args } => {
                    let addr = self.memory.read_word(addr_of_addr);
                    if self.suspend_for_call(addr, args)? {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn push_pending(&mut self, value: u32) {
        self.string_frames
            .last_mut()
            .expect("frame present")
            .pending
            .push_back(value);
    }

    fn finish_string(&mut self) {
        self.string_frames.pop();
        // The terminator stub is always the one directly below whatever
        // resume stubs this string pushed and already popped.
        if let Ok((_, _, ret_pc, ret_fp)) = self.stack.pop_call_stub() {
            self.stack.set_fp(ret_fp);
            self.pc = ret_pc;
        }
    }

    fn emit_char_or_suspend(&mut self, ch: u32, glk: &mut dyn GlkDispatcher) -> VmResult<bool> {
        match self.io_system {
            IoSystem::None => Ok(false),
            IoSystem::Glk => {
                let sel = if ch > 0xFF { selector::PUT_CHAR_UNI } else { selector::PUT_CHAR };
                glk.call(sel, &[ch], MemoryAccess::new(&mut self.memory));
                Ok(false)
            }
            IoSystem::Filter(filter_addr) => self.suspend_for_call(filter_addr, vec![ch]),
        }
    }

    /// Call `addr` with `args` as part of string production. Returns
    /// `true` if control suspended into real bytecode execution (caller
    /// must stop and let `step()`/`run()` proceed normally), `false` if
    /// an accelerated function answered synchronously.
    fn suspend_for_call(&mut self, addr: u32, args: Vec<u32>) -> VmResult<bool> {
        if self.accel.call(addr, &args).is_some() {
            return Ok(false);
        }
        let header = FunctionHeader::parse(&self.memory, addr)
            .ok_or(VmError::new(VmErrorKind::IllegalOpcode, self.pc))?;
        self.stack
            .push_call_stub(stub_kind::STRING_RESUME, 0, self.pc, self.stack.fp())?;
        self.pc = function::enter_function(&mut self.stack, &header, &args)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::encode_opcode;
    use crate::glk::NullGlk;

    fn assemble(start: u32, instrs: &[Vec<u8>]) -> Vec<u8> {
        let mut img = vec![0u8; 4096];
        img[0..4].copy_from_slice(&0x476C_756Cu32.to_be_bytes());
        img[8..12].copy_from_slice(&256u32.to_be_bytes());
        img[12..16].copy_from_slice(&256u32.to_be_bytes());
        img[16..20].copy_from_slice(&4096u32.to_be_bytes());
        img[20..24].copy_from_slice(&1024u32.to_be_bytes());
        img[24..28].copy_from_slice(&start.to_be_bytes());
        let mut cursor = start as usize;
        img[cursor] = 0xC0; // StackArgs function header
        cursor += 1;
        img[cursor] = 0;
        img[cursor + 1] = 0;
        cursor += 2;
        for instr in instrs {
            img[cursor..cursor + instr.len()].copy_from_slice(instr);
            cursor += instr.len();
        }
        img
    }

    fn mode_byte(lo: u8, hi: u8) -> u8 {
        (lo & 0x0F) | ((hi & 0x0F) << 4)
    }

    #[test]
    fn add_two_constants_and_quit() {
        let mut add = encode_opcode(op::ADD);
        add.push(mode_byte(0x1, 0x1)); // two signed-byte immediates
        add.push(mode_byte(0x0, 0)); // store: discard
        add.push(3);
        add.push(4);
        let quit = encode_opcode(op::QUIT);
        let img = assemble(64, &[add, quit]);
        let mut vm = Vm::new(&img, VmConfig::default()).unwrap();
        let mut glk = NullGlk;
        let outcome = vm.run(&mut glk).unwrap();
        assert_eq!(outcome, StepOutcome::Quit);
    }

    #[test]
    fn step_limit_is_honoured() {
        let nop = encode_opcode(op::NOP);
        let mut instrs = vec![nop.clone(); 5];
        instrs.push(encode_opcode(op::QUIT));
        let img = assemble(64, &instrs);
        let mut config = VmConfig::default();
        config.max_steps = Some(3);
        let mut vm = Vm::new(&img, config).unwrap();
        let mut glk = NullGlk;
        assert_eq!(vm.run(&mut glk).unwrap(), StepOutcome::StepLimitReached);
    }

    #[test]
    fn bad_image_is_rejected_at_load() {
        let img = vec![0u8; 40];
        let err = Vm::new(&img, VmConfig::default()).unwrap_err();
        assert_eq!(err.kind, VmErrorKind::BadImage);
    }

    #[test]
    fn saveundo_then_restoreundo_restores_ram() {
        let mut saveundo = encode_opcode(op::SAVEUNDO);
        saveundo.push(mode_byte(0x0, 0)); // discard result
        let mut copy_write = encode_opcode(op::COPY);
        copy_write.push(mode_byte(0x2, 0x7)); // load short immediate, store to addr (4-byte addr mode)
        copy_write.extend_from_slice(&0xBEEFu16.to_be_bytes());
        copy_write.extend_from_slice(&200u32.to_be_bytes());
        let mut restoreundo = encode_opcode(op::RESTOREUNDO);
        restoreundo.push(mode_byte(0x0, 0));
        let quit = encode_opcode(op::QUIT);
        let img = assemble(64, &[saveundo, copy_write, restoreundo, quit]);
        let mut vm = Vm::new(&img, VmConfig::default()).unwrap();
        let mut glk = NullGlk;
        vm.step(&mut glk).unwrap(); // saveundo
        vm.step(&mut glk).unwrap(); // copy (mutate RAM word at 200)
        assert_eq!(vm.memory().read_word(200), 0xBEEF);
        vm.step(&mut glk).unwrap(); // restoreundo
        assert_eq!(vm.memory().read_word(200), 0);
    }

    #[test]
    fn restoreundo_recovers_catch_points_and_string_frames() {
        let mut saveundo = encode_opcode(op::SAVEUNDO);
        saveundo.push(mode_byte(0x0, 0));
        let mut restoreundo = encode_opcode(op::RESTOREUNDO);
        restoreundo.push(mode_byte(0x0, 0));
        let quit = encode_opcode(op::QUIT);
        let img = assemble(64, &[saveundo, restoreundo, quit]);
        let mut vm = Vm::new(&img, VmConfig::default()).unwrap();
        let mut glk = NullGlk;

        // As if saveundo ran mid-catch and mid-Filter-string-output.
        vm.catch_points.push(CatchPoint { sp: 1, fp: 2, pc: 3, dest_type: 0, dest_addr: 0 });
        vm.string_frames.push(StringFrame {
            pending: VecDeque::from(vec![65, 66]),
            source: StringSource::Direct,
        });
        vm.step(&mut glk).unwrap(); // saveundo

        // Mutate both after the snapshot, as execution would before a throw.
        vm.catch_points.push(CatchPoint { sp: 9, fp: 9, pc: 9, dest_type: 0, dest_addr: 0 });
        vm.string_frames.clear();

        vm.step(&mut glk).unwrap(); // restoreundo

        assert_eq!(vm.catch_points.len(), 1);
        assert_eq!(vm.catch_points[0].pc, 3);
        assert_eq!(vm.string_frames.len(), 1);
        assert_eq!(vm.string_frames[0].pending, VecDeque::from(vec![65, 66]));
    }

    #[test]
    fn undo_ring_overflow_drops_oldest() {
        let mut config = VmConfig::default();
        config.undo_depth = 2;
        let nop = encode_opcode(op::NOP);
        let img = assemble(64, &[nop]);
        let mut vm = Vm::new(&img, config).unwrap();
        for _ in 0..3 {
            vm.undo.push(Snapshot::capture(
                &vm.memory,
                &vm.stack,
                vm.pc,
                0,
                0,
                Vec::new(),
                Vec::new(),
            ));
        }
        assert_eq!(vm.undo.len(), 2);
        assert!(vm.undo.has_undo());
    }
}
