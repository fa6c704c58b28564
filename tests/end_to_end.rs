//! Hand-assembled story-file fixtures exercising the engine end to end:
//! call/return, string output through a Glk stand-in, save/restore,
//! undo, and the ambient error/step-limit/undo-overflow paths.

use glulx::decode::encode_opcode;
use glulx::error::VmErrorKind;
use glulx::interp::StepOutcome;
use glulx::opcode as op;
use glulx::testing::RecordingGlk;
use glulx::{VmConfig, Vm};

const RAM_START: u32 = 256;
const STACK_SIZE: u32 = 2048;

struct Image {
    bytes: Vec<u8>,
    cursor: u32,
}

impl Image {
    fn new(end_mem: u32, start_func: u32) -> Self {
        let mut bytes = vec![0u8; end_mem as usize];
        bytes[0..4].copy_from_slice(&0x476C_756Cu32.to_be_bytes());
        bytes[8..12].copy_from_slice(&RAM_START.to_be_bytes());
        bytes[12..16].copy_from_slice(&RAM_START.to_be_bytes());
        bytes[16..20].copy_from_slice(&end_mem.to_be_bytes());
        bytes[20..24].copy_from_slice(&STACK_SIZE.to_be_bytes());
        bytes[24..28].copy_from_slice(&start_func.to_be_bytes());
        Self { bytes, cursor: start_func }
    }

    fn function_header_stackargs(&mut self) {
        self.bytes[self.cursor as usize] = 0xC0;
        self.cursor += 1;
        self.bytes[self.cursor as usize] = 0;
        self.bytes[self.cursor as usize + 1] = 0;
        self.cursor += 2;
    }

    fn op(&mut self, opcode: u32) -> &mut Self {
        for b in encode_opcode(opcode) {
            self.push(b);
        }
        self
    }

    fn modes(&mut self, nibbles: &[u8]) -> &mut Self {
        for pair in nibbles.chunks(2) {
            let lo = pair[0] & 0x0F;
            let hi = pair.get(1).copied().unwrap_or(0) & 0x0F;
            self.push(lo | (hi << 4));
        }
        self
    }

    fn byte(&mut self, v: u8) -> &mut Self {
        self.push(v);
        self
    }

    fn short(&mut self, v: u16) -> &mut Self {
        for b in v.to_be_bytes() {
            self.push(b);
        }
        self
    }

    fn word(&mut self, v: u32) -> &mut Self {
        for b in v.to_be_bytes() {
            self.push(b);
        }
        self
    }

    fn push(&mut self, b: u8) {
        self.bytes[self.cursor as usize] = b;
        self.cursor += 1;
    }

    fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

#[test]
fn add_and_quit() {
    let mut img = Image::new(512, 64);
    img.function_header_stackargs();
    img.op(op::ADD).modes(&[1, 1, 0]).byte(3).byte(4); // discard store, mode 0
    img.op(op::QUIT);
    let mut vm = Vm::new(&img.finish(), VmConfig::default()).unwrap();
    let mut glk = RecordingGlk::new();
    assert_eq!(vm.run(&mut glk).unwrap(), StepOutcome::Quit);
}

#[test]
fn call_a_function_and_return_its_value() {
    // main: call callee(), discard result, quit.
    // callee (at 128): stack-args, returns constant 42.
    let mut img = Image::new(512, 64);
    img.function_header_stackargs();
    img.op(op::CALL)
        .modes(&[3, 0, 0]) // addr: 4-byte immediate, argc: const 0, store: discard
        .word(128);
    img.op(op::QUIT);

    img.cursor = 128;
    img.function_header_stackargs();
    img.op(op::RETURN).modes(&[1]).byte(42);

    let bytes = img.finish();
    let mut vm = Vm::new(&bytes, VmConfig::default()).unwrap();
    let mut glk = RecordingGlk::new();
    assert_eq!(vm.run(&mut glk).unwrap(), StepOutcome::Quit);
}

#[test]
fn streamchar_emits_through_glk_when_io_system_is_glk() {
    // setiosys(2, 0) selects the Glk I/O system (mode 2), then streamchar
    // 'A', then quit.
    let mut img = Image::new(512, 64);
    img.function_header_stackargs();
    img.op(op::SETIOSYS).modes(&[1, 1]).byte(2).byte(0);
    img.op(op::STREAMCHAR).modes(&[1]).byte(b'A');
    img.op(op::QUIT);

    let mut vm = Vm::new(&img.finish(), VmConfig::default()).unwrap();
    let mut glk = RecordingGlk::new();
    assert_eq!(vm.run(&mut glk).unwrap(), StepOutcome::Quit);
    assert_eq!(glk.output_as_string(), "A");
}

#[test]
fn saveundo_then_restoreundo_reverts_a_memory_write() {
    let mut img = Image::new(512, 64);
    img.function_header_stackargs();
    img.op(op::SAVEUNDO).modes(&[0]); // discard result
    img.op(op::COPY)
        .modes(&[2, 7])
        .short(0xBEEF)
        .word(300);
    img.op(op::RESTOREUNDO).modes(&[0]);
    img.op(op::QUIT);

    let mut vm = Vm::new(&img.finish(), VmConfig::default()).unwrap();
    let mut glk = RecordingGlk::new();
    vm.step(&mut glk).unwrap(); // saveundo
    vm.step(&mut glk).unwrap(); // copy
    assert_eq!(vm.memory().read_word(300), 0xBEEF);
    vm.step(&mut glk).unwrap(); // restoreundo
    assert_eq!(vm.memory().read_word(300), 0);
}

#[test]
fn save_and_restore_roundtrip_through_a_glk_stream() {
    let mut img = Image::new(512, 64);
    img.function_header_stackargs();
    img.op(op::COPY).modes(&[2, 7]).short(0x1234).word(300);
    img.op(op::SAVE).modes(&[1, 0]).byte(7); // stream id 7, discard result
    img.op(op::COPY).modes(&[1, 7]).byte(0).word(300); // clobber it
    img.op(op::RESTORE).modes(&[1, 0]).byte(7);
    img.op(op::QUIT);

    let mut vm = Vm::new(&img.finish(), VmConfig::default()).unwrap();
    let mut glk = RecordingGlk::new();
    vm.step(&mut glk).unwrap(); // copy 0x1234
    vm.step(&mut glk).unwrap(); // save
    vm.step(&mut glk).unwrap(); // clobber to 0
    assert_eq!(vm.memory().read_word(300), 0);
    vm.step(&mut glk).unwrap(); // restore
    assert_eq!(vm.memory().read_word(300), 0x1234);
}

#[test]
fn bad_image_header_is_rejected() {
    let bytes = vec![0u8; 40];
    let err = Vm::new(&bytes, VmConfig::default()).unwrap_err();
    assert_eq!(err.kind, VmErrorKind::BadImage);
}

#[test]
fn step_limit_halts_an_infinite_loop() {
    // A 3-byte `jump -1` instruction that branches right back to its own
    // start: an infinite loop, bounded only by max_steps.
    let mut img = Image::new(512, 64);
    img.function_header_stackargs();
    img.op(op::JUMP).modes(&[1]).byte(0xFF);

    let mut config = VmConfig::default();
    config.max_steps = Some(10);
    let mut vm = Vm::new(&img.finish(), config).unwrap();
    let mut glk = RecordingGlk::new();
    assert_eq!(vm.run(&mut glk).unwrap(), StepOutcome::StepLimitReached);
}

#[test]
fn undo_ring_respects_configured_depth() {
    let mut img = Image::new(512, 64);
    img.function_header_stackargs();
    for _ in 0..5 {
        img.op(op::SAVEUNDO).modes(&[0]);
    }
    img.op(op::QUIT);

    let mut config = VmConfig::default();
    config.undo_depth = 2;
    let mut vm = Vm::new(&img.finish(), config).unwrap();
    let mut glk = RecordingGlk::new();
    assert_eq!(vm.run(&mut glk).unwrap(), StepOutcome::Quit);
}

#[test]
fn divide_by_zero_is_a_fatal_error() {
    let mut img = Image::new(512, 64);
    img.function_header_stackargs();
    img.op(op::DIV).modes(&[1, 1, 0]).byte(10).byte(0);
    img.op(op::QUIT);

    let mut vm = Vm::new(&img.finish(), VmConfig::default()).unwrap();
    let mut glk = RecordingGlk::new();
    let err = vm.run(&mut glk).unwrap_err();
    assert_eq!(err.kind, VmErrorKind::DivideByZero);
}
