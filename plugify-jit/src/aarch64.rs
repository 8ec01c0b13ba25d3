//! AArch64 trampoline emitter (AAPCS64, ELF flavour).
//!
//! Fixed-width words make this much more pleasant than x86. One deliberate
//! deviation from the procedure call standard: memory returns use an
//! explicit pointer in the first argument register rather than x8, keeping
//! both bridge directions symmetric with the x86-64 lowering. Both sides of
//! every bridged call are generated here, so the convention only has to
//! agree with itself.

use crate::sig::{FuncSignature, TypeSlot};
use crate::{JitError, WaitType};

const FP: u8 = 29;
const LR: u8 = 30;
const SP: u8 = 31;

struct Asm {
	buf: Vec<u8>,
}

impl Asm {
	fn new() -> Self {
		Self { buf: Vec::with_capacity(256) }
	}

	fn word(&mut self, w: u32) {
		self.buf.extend_from_slice(&w.to_le_bytes());
	}

	/// stp x1, x2, [sp, #-16]!
	fn stp_pre(&mut self, r1: u8, r2: u8) {
		self.word(0xA9800000 | (0x7E << 15) | ((r2 as u32) << 10) | ((SP as u32) << 5) | r1 as u32);
	}

	/// ldp x1, x2, [sp], #16
	fn ldp_post(&mut self, r1: u8, r2: u8) {
		self.word(0xA8C00000 | (2 << 15) | ((r2 as u32) << 10) | ((SP as u32) << 5) | r1 as u32);
	}

	/// mov xd, xs (register alias; use `add_sp_imm` for the stack pointer).
	fn mov_rr(&mut self, dst: u8, src: u8) {
		self.word(0xAA0003E0 | ((src as u32) << 16) | dst as u32);
	}

	/// add xd, xn, #imm12 (also the sp-to-register move).
	fn add_imm(&mut self, dst: u8, src: u8, imm: u32) {
		debug_assert!(imm < 4096);
		self.word(0x91000000 | (imm << 10) | ((src as u32) << 5) | dst as u32);
	}

	/// sub sp, sp, #imm12.
	fn sub_sp(&mut self, imm: u32) {
		debug_assert!(imm < 4096);
		self.word(0xD10003FF | (imm << 10));
	}

	fn add_sp(&mut self, imm: u32) {
		debug_assert!(imm < 4096);
		self.word(0x910003FF | (imm << 10));
	}

	/// Full 64-bit immediate via movz + movk chain.
	fn mov_imm64(&mut self, dst: u8, imm: u64) {
		let chunks = [
			(imm & 0xFFFF) as u32,
			((imm >> 16) & 0xFFFF) as u32,
			((imm >> 32) & 0xFFFF) as u32,
			((imm >> 48) & 0xFFFF) as u32,
		];
		self.word(0xD2800000 | (chunks[0] << 5) | dst as u32);
		for (hw, &c) in chunks.iter().enumerate().skip(1) {
			if c != 0 {
				self.word(0xF2800000 | ((hw as u32) << 21) | (c << 5) | dst as u32);
			}
		}
	}

	/// movz wd, #imm16.
	fn mov_imm32(&mut self, dst: u8, imm: u16) {
		self.word(0x52800000 | ((imm as u32) << 5) | dst as u32);
	}

	/// ldr xt, [xn, #off] (off a multiple of 8).
	fn ldr(&mut self, rt: u8, rn: u8, off: u32) {
		self.word(0xF9400000 | ((off / 8) << 10) | ((rn as u32) << 5) | rt as u32);
	}

	/// str xt, [xn, #off].
	fn str(&mut self, rt: u8, rn: u8, off: u32) {
		self.word(0xF9000000 | ((off / 8) << 10) | ((rn as u32) << 5) | rt as u32);
	}

	/// ldr dt, [xn, #off].
	fn ldr_d(&mut self, rt: u8, rn: u8, off: u32) {
		self.word(0xFD400000 | ((off / 8) << 10) | ((rn as u32) << 5) | rt as u32);
	}

	/// str dt, [xn, #off].
	fn str_d(&mut self, rt: u8, rn: u8, off: u32) {
		self.word(0xFD000000 | ((off / 8) << 10) | ((rn as u32) << 5) | rt as u32);
	}

	/// ldr qt, [xn, #off] (off a multiple of 16).
	fn ldr_q(&mut self, rt: u8, rn: u8, off: u32) {
		self.word(0x3DC00000 | ((off / 16) << 10) | ((rn as u32) << 5) | rt as u32);
	}

	/// str qt, [xn, #off].
	fn str_q(&mut self, rt: u8, rn: u8, off: u32) {
		self.word(0x3D800000 | ((off / 16) << 10) | ((rn as u32) << 5) | rt as u32);
	}

	fn blr(&mut self, rn: u8) {
		self.word(0xD63F0000 | ((rn as u32) << 5));
	}

	fn ret(&mut self) {
		self.word(0xD65F03C0);
	}

	fn brk(&mut self) {
		self.word(0xD4200000);
	}

	/// Widen the integer return in w0/x0 to a full 64-bit slot value.
	fn widen_x0(&mut self, slot: TypeSlot) {
		match slot {
			TypeSlot::Bool | TypeSlot::UInt8 | TypeSlot::Char8 => self.word(0x53001C00), // uxtb w0, w0
			TypeSlot::UInt16 | TypeSlot::Char16 => self.word(0x53003C00), // uxth w0, w0
			TypeSlot::UInt32 => self.word(0x2A0003E0), // mov w0, w0
			TypeSlot::Int8 => self.word(0x93401C00), // sxtb x0, w0
			TypeSlot::Int16 => self.word(0x93403C00), // sxth x0, w0
			TypeSlot::Int32 => self.word(0x93407C00), // sxtw x0, w0
			_ => {}
		}
	}
}

#[derive(Debug, Clone, Copy)]
enum ArgHome {
	Gp(u8),
	Fp(u8),
	Stack(u32),
}

fn assign_homes(sig: &FuncSignature) -> Result<(Vec<ArgHome>, u32), JitError> {
	let mut homes = Vec::with_capacity(sig.args.len());
	let mut gp = 0u8;
	let mut fp = 0u8;
	let mut stack = 0u32;

	for &arg in sig.args.iter() {
		if arg.is_int() {
			if gp < 8 {
				homes.push(ArgHome::Gp(gp));
				gp += 1;
			} else {
				homes.push(ArgHome::Stack(stack));
				stack += 8;
			}
		} else if arg.is_float() {
			if fp < 8 {
				homes.push(ArgHome::Fp(fp));
				fp += 1;
			} else {
				homes.push(ArgHome::Stack(stack));
				stack += 8;
			}
		} else {
			return Err(JitError::WideParameter);
		}
	}

	Ok((homes, stack))
}

fn align16(v: u32) -> u32 {
	(v + 15) & !15
}

pub fn emit_callback(
	sig: &FuncSignature,
	method: usize,
	handler: usize,
	data: usize,
	hidden: bool,
) -> Result<Vec<u8>, JitError> {
	let (homes, _) = assign_homes(sig)?;
	let argc = sig.args.len() as u32;

	// params block at sp, 16-aligned return buffer above it
	let retbuf = align16(8 * argc);
	let frame = retbuf + 16;

	let mut a = Asm::new();
	a.stp_pre(FP, LR);
	a.add_imm(FP, SP, 0);
	a.sub_sp(frame);

	for (i, home) in homes.iter().enumerate() {
		let slot = 8 * i as u32;
		match *home {
			ArgHome::Gp(n) => a.str(n, SP, slot),
			ArgHome::Fp(n) => a.str_d(n, SP, slot),
			ArgHome::Stack(off) => {
				// incoming stack args sit above our frame record
				a.ldr(9, FP, 16 + off);
				a.str(9, SP, slot);
			}
		}
	}

	a.mov_imm64(0, method as u64);
	a.mov_imm64(1, data as u64);
	a.add_imm(2, SP, if hidden { 8 } else { 0 });
	a.mov_imm32(3, (argc - hidden as u32) as u16);
	if hidden {
		a.ldr(4, SP, 0);
	} else {
		a.add_imm(4, SP, retbuf);
	}
	a.mov_imm64(16, handler as u64);
	a.blr(16);

	if hidden {
		a.ldr(0, SP, 0);
	} else {
		match sig.ret {
			TypeSlot::Void => {}
			TypeSlot::Float | TypeSlot::Double => a.ldr_d(0, SP, retbuf),
			TypeSlot::Vec2F => a.ldr_d(0, SP, retbuf),
			TypeSlot::Vec3F | TypeSlot::Vec4F => a.ldr_q(0, SP, retbuf),
			ret if ret.is_int() => a.ldr(0, SP, retbuf),
			ret => return Err(JitError::BadReturn(ret)),
		}
	}

	a.add_sp(frame);
	a.ldp_post(FP, LR);
	a.ret();

	Ok(a.buf)
}

pub fn emit_call(
	sig: &FuncSignature,
	target: usize,
	wait: WaitType,
	_hidden: bool,
) -> Result<Vec<u8>, JitError> {
	let (homes, stack_bytes) = assign_homes(sig)?;
	let outgoing = align16(stack_bytes);

	let mut a = Asm::new();
	a.stp_pre(FP, LR);
	a.add_imm(FP, SP, 0);
	a.stp_pre(19, 20);
	a.sub_sp(outgoing);

	// params and ret survive the call in callee-saved registers
	a.mov_rr(19, 0);
	a.mov_rr(20, 1);

	match wait {
		WaitType::None => {}
		WaitType::Breakpoint => a.brk(),
		WaitType::Keypress => {
			a.mov_imm64(16, crate::call::wait_keypress as usize as u64);
			a.blr(16);
		}
	}

	for (i, home) in homes.iter().enumerate() {
		let slot = 8 * i as u32;
		match *home {
			ArgHome::Gp(n) => a.ldr(n, 19, slot),
			ArgHome::Fp(n) => a.ldr_d(n, 19, slot),
			ArgHome::Stack(off) => {
				a.ldr(9, 19, slot);
				a.str(9, SP, off);
			}
		}
	}

	a.mov_imm64(16, target as u64);
	a.blr(16);

	match sig.ret {
		TypeSlot::Void => {}
		TypeSlot::Float | TypeSlot::Double => a.str_d(0, 20, 0),
		TypeSlot::Vec2F => a.str_d(0, 20, 0),
		TypeSlot::Vec3F | TypeSlot::Vec4F => a.str_q(0, 20, 0),
		ret if ret.is_int() => {
			a.widen_x0(ret);
			a.str(0, 20, 0);
		}
		ret => return Err(JitError::BadReturn(ret)),
	}

	a.add_sp(outgoing);
	a.ldp_post(19, 20);
	a.ldp_post(FP, LR);
	a.ret();

	Ok(a.buf)
}
