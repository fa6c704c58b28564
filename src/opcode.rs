//! Opcode numbers and their operand shape (load/store counts, in the
//! fixed load-then-store order the addressing-mode nibbles are packed
//! in).

pub const NOP: u32 = 0x00;

pub const ADD: u32 = 0x10;
pub const SUB: u32 = 0x11;
pub const MUL: u32 = 0x12;
pub const DIV: u32 = 0x13;
pub const MOD: u32 = 0x14;
pub const NEG: u32 = 0x15;
pub const BITAND: u32 = 0x18;
pub const BITOR: u32 = 0x19;
pub const BITXOR: u32 = 0x1A;
pub const BITNOT: u32 = 0x1B;
pub const SHIFTL: u32 = 0x1C;
pub const SSHIFTR: u32 = 0x1D;
pub const USHIFTR: u32 = 0x1E;

pub const JUMP: u32 = 0x20;
pub const JZ: u32 = 0x22;
pub const JNZ: u32 = 0x23;
pub const JEQ: u32 = 0x24;
pub const JNE: u32 = 0x25;
pub const JLT: u32 = 0x26;
pub const JGE: u32 = 0x27;
pub const JGT: u32 = 0x28;
pub const JLE: u32 = 0x29;
pub const JLTU: u32 = 0x2A;
pub const JGEU: u32 = 0x2B;
pub const JGTU: u32 = 0x2C;
pub const JLEU: u32 = 0x2D;
pub const JUMPABS: u32 = 0x104;

pub const CALL: u32 = 0x30;
pub const RETURN: u32 = 0x31;
pub const CATCH: u32 = 0x32;
pub const THROW: u32 = 0x33;
pub const TAILCALL: u32 = 0x34;

pub const COPY: u32 = 0x40;
pub const COPYS: u32 = 0x41;
pub const COPYB: u32 = 0x42;
pub const SEXS: u32 = 0x44;
pub const SEXB: u32 = 0x45;

pub const ALOAD: u32 = 0x48;
pub const ALOADS: u32 = 0x49;
pub const ALOADB: u32 = 0x4A;
pub const ALOADBIT: u32 = 0x4B;
pub const ASTORE: u32 = 0x4C;
pub const ASTORES: u32 = 0x4D;
pub const ASTOREB: u32 = 0x4E;
pub const ASTOREBIT: u32 = 0x4F;

pub const STKCOUNT: u32 = 0x50;
pub const STKPEEK: u32 = 0x51;
pub const STKSWAP: u32 = 0x52;
pub const STKROLL: u32 = 0x53;
pub const STKCOPY: u32 = 0x54;

pub const STREAMCHAR: u32 = 0x70;
pub const STREAMNUM: u32 = 0x71;
pub const STREAMSTR: u32 = 0x72;
pub const STREAMUNICHAR: u32 = 0x73;

pub const GESTALT: u32 = 0x100;
pub const GETMEMSIZE: u32 = 0x102;
pub const SETMEMSIZE: u32 = 0x103;

pub const RANDOM: u32 = 0x110;
pub const SETRANDOM: u32 = 0x111;

pub const QUIT: u32 = 0x120;
pub const VERIFY: u32 = 0x121;
pub const RESTART: u32 = 0x122;
pub const SAVE: u32 = 0x123;
pub const RESTORE: u32 = 0x124;
pub const SAVEUNDO: u32 = 0x125;
pub const RESTOREUNDO: u32 = 0x126;
pub const PROTECT: u32 = 0x127;
pub const HASUNDO: u32 = 0x128;
pub const DISCARDUNDO: u32 = 0x129;
pub const GETSTRINGTBL: u32 = 0x12A;
pub const SETSTRINGTBL: u32 = 0x12B;

pub const GLK: u32 = 0x130;
pub const GETIOSYS: u32 = 0x131;
pub const SETIOSYS: u32 = 0x132;

pub const LINEARSEARCH: u32 = 0x150;
pub const BINARYSEARCH: u32 = 0x151;
pub const LINKEDSEARCH: u32 = 0x152;

pub const MZERO: u32 = 0x160;
pub const MCOPY: u32 = 0x161;
pub const MALLOC: u32 = 0x170;
pub const MFREE: u32 = 0x171;

pub const ACCELFUNC: u32 = 0x180;
pub const ACCELPARAM: u32 = 0x181;

pub const NUMTOF: u32 = 0x190;
pub const FTONUMZ: u32 = 0x191;
pub const FTONUMN: u32 = 0x192;
pub const CEILF: u32 = 0x193;
pub const FLOORF: u32 = 0x194;
pub const FADD: u32 = 0x195;
pub const FSUB: u32 = 0x196;
pub const FMUL: u32 = 0x197;
pub const FDIV: u32 = 0x198;
pub const FMOD: u32 = 0x199;
pub const SQRT: u32 = 0x19A;
pub const EXP: u32 = 0x19B;
pub const LOG: u32 = 0x19C;
pub const POW: u32 = 0x19D;
pub const SIN: u32 = 0x19E;
pub const COS: u32 = 0x19F;
pub const TAN: u32 = 0x1A0;
pub const JFEQ: u32 = 0x1A1;
pub const JFNE: u32 = 0x1A2;
pub const JFLT: u32 = 0x1A3;
pub const JFGT: u32 = 0x1A4;
pub const JFISNAN: u32 = 0x1A5;

pub const NUMTOD: u32 = 0x1B0;
pub const DTONUMZ: u32 = 0x1B1;
pub const DTONUMN: u32 = 0x1B2;
pub const DADD: u32 = 0x1B3;
pub const DSUB: u32 = 0x1B4;
pub const DMUL: u32 = 0x1B5;
pub const DDIV: u32 = 0x1B6;
pub const DSQRT: u32 = 0x1B7;
pub const JDEQ: u32 = 0x1B8;
pub const JDNE: u32 = 0x1B9;
pub const JDLT: u32 = 0x1BA;
pub const JDGT: u32 = 0x1BB;
pub const JDISNAN: u32 = 0x1BC;
