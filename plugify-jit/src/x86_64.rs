//! x86-64 trampoline emitter (System V and Win64).
//!
//! No general assembler here, just the handful of encodings the two
//! trampoline shapes need. Everything is rbp-framed; argument slots and the
//! return buffer live in the frame, outgoing call space sits below them.

use crate::sig::{CallConv, FuncSignature, TypeSlot};
use crate::{JitError, WaitType};

// General purpose register numbers (ModRM encoding order).
const RAX: u8 = 0;
const RCX: u8 = 1;
const RDX: u8 = 2;
const RBX: u8 = 3;
const RSP: u8 = 4;
const RBP: u8 = 5;
const RSI: u8 = 6;
const RDI: u8 = 7;
const R8: u8 = 8;
const R9: u8 = 9;
const R10: u8 = 10;
const R12: u8 = 12;

const SYSV_GP: [u8; 6] = [RDI, RSI, RDX, RCX, R8, R9];
const WIN_GP: [u8; 4] = [RCX, RDX, R8, R9];

struct Asm {
	buf: Vec<u8>,
}

impl Asm {
	fn new() -> Self {
		Self { buf: Vec::with_capacity(256) }
	}

	fn byte(&mut self, b: u8) {
		self.buf.push(b);
	}

	fn bytes(&mut self, bs: &[u8]) {
		self.buf.extend_from_slice(bs);
	}

	fn imm32(&mut self, v: i32) {
		self.buf.extend_from_slice(&v.to_le_bytes());
	}

	fn imm64(&mut self, v: u64) {
		self.buf.extend_from_slice(&v.to_le_bytes());
	}

	/// ModRM + optional SIB + disp32 for a `[base + disp]` operand.
	fn modrm_mem(&mut self, reg: u8, base: u8, disp: i32) {
		self.byte(0x80 | ((reg & 7) << 3) | (base & 7));
		if base & 7 == RSP {
			// rsp/r12 bases need a SIB with no index
			self.byte(0x24);
		}
		self.imm32(disp);
	}

	fn push(&mut self, reg: u8) {
		if reg >= 8 {
			self.byte(0x41);
		}
		self.byte(0x50 + (reg & 7));
	}

	fn pop(&mut self, reg: u8) {
		if reg >= 8 {
			self.byte(0x41);
		}
		self.byte(0x58 + (reg & 7));
	}

	/// mov dst, src (64-bit).
	fn mov_rr(&mut self, dst: u8, src: u8) {
		self.byte(0x48 | ((src >> 3) << 2) | (dst >> 3));
		self.byte(0x89);
		self.byte(0xC0 | ((src & 7) << 3) | (dst & 7));
	}

	/// mov reg, imm64.
	fn mov_ri64(&mut self, reg: u8, imm: u64) {
		self.byte(0x48 | (reg >> 3));
		self.byte(0xB8 + (reg & 7));
		self.imm64(imm);
	}

	/// mov reg32, imm32 (zero-extends).
	fn mov_ri32(&mut self, reg: u8, imm: u32) {
		if reg >= 8 {
			self.byte(0x41);
		}
		self.byte(0xB8 + (reg & 7));
		self.imm32(imm as i32);
	}

	/// mov reg, qword [base + disp].
	fn load(&mut self, reg: u8, base: u8, disp: i32) {
		self.byte(0x48 | ((reg >> 3) << 2) | (base >> 3));
		self.byte(0x8B);
		self.modrm_mem(reg, base, disp);
	}

	/// mov qword [base + disp], reg.
	fn store(&mut self, base: u8, disp: i32, reg: u8) {
		self.byte(0x48 | ((reg >> 3) << 2) | (base >> 3));
		self.byte(0x89);
		self.modrm_mem(reg, base, disp);
	}

	/// lea reg, [base + disp].
	fn lea(&mut self, reg: u8, base: u8, disp: i32) {
		self.byte(0x48 | ((reg >> 3) << 2) | (base >> 3));
		self.byte(0x8D);
		self.modrm_mem(reg, base, disp);
	}

	/// movq xmm, qword [base + disp].
	fn load_x(&mut self, xmm: u8, base: u8, disp: i32) {
		self.byte(0xF3);
		if xmm >= 8 || base >= 8 {
			self.byte(0x40 | ((xmm >> 3) << 2) | (base >> 3));
		}
		self.bytes(&[0x0F, 0x7E]);
		self.modrm_mem(xmm, base, disp);
	}

	/// movq qword [base + disp], xmm.
	fn store_x(&mut self, base: u8, disp: i32, xmm: u8) {
		self.byte(0x66);
		if xmm >= 8 || base >= 8 {
			self.byte(0x40 | ((xmm >> 3) << 2) | (base >> 3));
		}
		self.bytes(&[0x0F, 0xD6]);
		self.modrm_mem(xmm, base, disp);
	}

	/// movq gp, xmm (for the Win64 variadic duplication rule).
	fn movq_rx(&mut self, gp: u8, xmm: u8) {
		self.byte(0x66);
		self.byte(0x48 | ((xmm >> 3) << 2) | (gp >> 3));
		self.bytes(&[0x0F, 0x7E]);
		self.byte(0xC0 | ((xmm & 7) << 3) | (gp & 7));
	}

	fn sub_rsp(&mut self, imm: i32) {
		self.bytes(&[0x48, 0x81, 0xEC]);
		self.imm32(imm);
	}

	fn add_rsp(&mut self, imm: i32) {
		self.bytes(&[0x48, 0x81, 0xC4]);
		self.imm32(imm);
	}

	fn call_reg(&mut self, reg: u8) {
		if reg >= 8 {
			self.byte(0x41);
		}
		self.bytes(&[0xFF, 0xD0 | (reg & 7)]);
	}

	fn ret(&mut self) {
		self.byte(0xC3);
	}

	fn leave(&mut self) {
		self.byte(0xC9);
	}

	fn int3(&mut self) {
		self.byte(0xCC);
	}

	/// Widen the integer return in rax to a full 64-bit slot value.
	fn widen_rax(&mut self, slot: TypeSlot) {
		match slot {
			TypeSlot::Bool | TypeSlot::UInt8 | TypeSlot::Char8 => self.bytes(&[0x0F, 0xB6, 0xC0]), // movzx eax, al
			TypeSlot::UInt16 | TypeSlot::Char16 => self.bytes(&[0x0F, 0xB7, 0xC0]), // movzx eax, ax
			TypeSlot::UInt32 => self.bytes(&[0x89, 0xC0]), // mov eax, eax
			TypeSlot::Int8 => self.bytes(&[0x48, 0x0F, 0xBE, 0xC0]), // movsx rax, al
			TypeSlot::Int16 => self.bytes(&[0x48, 0x0F, 0xBF, 0xC0]), // movsx rax, ax
			TypeSlot::Int32 => self.bytes(&[0x48, 0x63, 0xC0]), // movsxd rax, eax
			_ => {}
		}
	}
}

fn is_windows_conv(conv: CallConv) -> bool {
	matches!(conv, CallConv::Win64 | CallConv::Vectorcall)
}

/// Where one native argument lives at function entry / call time.
#[derive(Debug, Clone, Copy)]
enum ArgHome {
	Gp(u8),
	Xmm(u8),
	/// Byte offset into the stack argument area, from its start.
	Stack(i32),
}

/// Assigns homes for every argument under the given convention. Also reports
/// how many xmm registers carry arguments (the SysV variadic `al` count) and
/// the stack byte count.
///
/// Win64 is positional: argument slot i < 4 picks register i of either file.
/// Vectorcall widens the floating file to xmm0-xmm5 and counts each file
/// independently, like SysV does with its own limits.
fn assign_homes(sig: &FuncSignature) -> Result<(Vec<ArgHome>, u8, i32), JitError> {
	let mut homes = Vec::with_capacity(sig.args.len());
	let mut gp = 0usize;
	let mut fp = 0usize;
	let mut stack = 0i32;

	for (i, &arg) in sig.args.iter().enumerate() {
		if arg.is_int() {
			let home = match sig.conv {
				CallConv::Win64 => {
					if i < 4 { Some(ArgHome::Gp(WIN_GP[i])) } else { None }
				}
				CallConv::Vectorcall => {
					if gp < WIN_GP.len() { Some(ArgHome::Gp(WIN_GP[gp])) } else { None }
				}
				_ => {
					if gp < SYSV_GP.len() { Some(ArgHome::Gp(SYSV_GP[gp])) } else { None }
				}
			};
			gp += 1;
			homes.push(home.unwrap_or_else(|| {
				let h = ArgHome::Stack(stack);
				stack += 8;
				h
			}));
		} else if arg.is_float() {
			let home = match sig.conv {
				CallConv::Win64 => {
					if i < 4 { Some(ArgHome::Xmm(i as u8)) } else { None }
				}
				CallConv::Vectorcall => {
					if fp < 6 { Some(ArgHome::Xmm(fp as u8)) } else { None }
				}
				_ => {
					if fp < 8 { Some(ArgHome::Xmm(fp as u8)) } else { None }
				}
			};
			fp += 1;
			homes.push(home.unwrap_or_else(|| {
				let h = ArgHome::Stack(stack);
				stack += 8;
				h
			}));
		} else {
			return Err(JitError::WideParameter);
		}
	}

	let fp_in_regs = match sig.conv {
		// positional: count float args in the first four slots
		CallConv::Win64 => sig.args.iter().take(4).filter(|a| a.is_float()).count(),
		CallConv::Vectorcall => fp.min(6),
		_ => fp.min(8),
	};

	Ok((homes, fp_in_regs as u8, stack))
}

fn align16(v: i32) -> i32 {
	(v + 15) & !15
}

/// Builds a function with `sig`'s native shape that spills its arguments
/// into a slot array and forwards to `handler`.
///
/// When `hidden` is set, `sig.args[0]` is the memory-return pointer: the
/// handler receives the block advanced past it, the count reduced by one, and
/// the pointer itself as the return slot. The pointer is also the function's
/// return value, as the integer-register convention requires.
pub fn emit_callback(
	sig: &FuncSignature,
	method: usize,
	handler: usize,
	data: usize,
	hidden: bool,
) -> Result<Vec<u8>, JitError> {
	let windows = is_windows_conv(sig.conv);
	// the handler is a host function regardless of the native signature's
	// convention
	let host_windows = cfg!(windows);
	let (homes, _, _) = assign_homes(sig)?;
	let argc = sig.args.len() as i32;

	// frame: [ret buffer][params block] below rbp, outgoing call area at rsp
	let pblock = -8 * argc;
	let retbuf = pblock - 16;
	let locals = align16(8 * argc + 16);
	let outgoing = if host_windows { 48 } else { 0 };
	// incoming stack args start past the saved rbp and return address, plus
	// the caller-provided shadow space on windows
	let in_stack_base = if windows { 16 + 32 } else { 16 };

	let mut a = Asm::new();
	a.push(RBP);
	a.mov_rr(RBP, RSP);
	a.sub_rsp(locals + outgoing);

	// spill every native argument into its slot
	for (i, home) in homes.iter().enumerate() {
		let slot = pblock + 8 * i as i32;
		match *home {
			ArgHome::Gp(reg) => a.store(RBP, slot, reg),
			ArgHome::Xmm(reg) => a.store_x(RBP, slot, reg),
			ArgHome::Stack(off) => {
				a.load(RAX, RBP, in_stack_base + off);
				a.store(RBP, slot, RAX);
			}
		}
	}

	// hand off to the uniform handler
	let params_off = if hidden { pblock + 8 } else { pblock };
	let passed_argc = (argc - hidden as i32) as u32;
	if host_windows {
		a.mov_ri64(RCX, method as u64);
		a.mov_ri64(RDX, data as u64);
		a.lea(R8, RBP, params_off);
		a.mov_ri32(R9, passed_argc);
		if hidden {
			a.load(RAX, RBP, pblock);
		} else {
			a.lea(RAX, RBP, retbuf);
		}
		a.store(RSP, 32, RAX); // fifth argument
	} else {
		a.mov_ri64(RDI, method as u64);
		a.mov_ri64(RSI, data as u64);
		a.lea(RDX, RBP, params_off);
		a.mov_ri32(RCX, passed_argc);
		if hidden {
			a.load(R8, RBP, pblock);
		} else {
			a.lea(R8, RBP, retbuf);
		}
	}
	a.mov_ri64(RAX, handler as u64);
	a.call_reg(RAX);

	// produce the native return value
	if hidden {
		a.load(RAX, RBP, pblock);
	} else {
		match sig.ret {
			TypeSlot::Void => {}
			TypeSlot::Float | TypeSlot::Double => a.load_x(0, RBP, retbuf),
			TypeSlot::Vec2F => {
				if windows {
					a.load(RAX, RBP, retbuf);
				} else {
					a.load_x(0, RBP, retbuf);
				}
			}
			TypeSlot::Vec3F | TypeSlot::Vec4F => {
				if windows {
					// reaches here only if the hidden predicate was wrong
					return Err(JitError::BadReturn(sig.ret));
				}
				a.load_x(0, RBP, retbuf);
				a.load_x(1, RBP, retbuf + 8);
			}
			ret if ret.is_int() => a.load(RAX, RBP, retbuf),
			ret => return Err(JitError::BadReturn(ret)),
		}
	}

	a.leave();
	a.ret();

	Ok(a.buf)
}

/// Builds `fn(params, ret)` in the host convention that unpacks the slot
/// array into `sig`'s native argument homes and invokes `target`.
pub fn emit_call(
	sig: &FuncSignature,
	target: usize,
	wait: WaitType,
	_hidden: bool,
) -> Result<Vec<u8>, JitError> {
	let windows = is_windows_conv(sig.conv);
	let host_windows = cfg!(windows);
	let (homes, fp_in_regs, stack_bytes) = assign_homes(sig)?;

	// outgoing stack area for the target, shadow space included
	let outgoing = align16(stack_bytes + if windows { 32 } else { 0 });
	let out_base = if windows { 32 } else { 0 };

	let mut a = Asm::new();
	a.push(RBP);
	a.mov_rr(RBP, RSP);
	a.push(RBX);
	a.push(R12);
	// rbp + rbx + r12 is an odd push count, so rsp is back on a 16-byte
	// boundary here and the outgoing area keeps it there
	a.sub_rsp(outgoing);

	// park the wrapper's own arguments in callee-saved registers
	if host_windows {
		a.mov_rr(RBX, RCX); // params
		a.mov_rr(R12, RDX); // ret
	} else {
		a.mov_rr(RBX, RDI);
		a.mov_rr(R12, RSI);
	}

	match wait {
		WaitType::None => {}
		WaitType::Breakpoint => a.int3(),
		WaitType::Keypress => {
			a.mov_ri64(RAX, crate::call::wait_keypress as usize as u64);
			a.call_reg(RAX);
		}
	}

	// materialise every slot into its native home
	for (i, home) in homes.iter().enumerate() {
		let slot = 8 * i as i32;
		match *home {
			ArgHome::Gp(reg) => a.load(reg, RBX, slot),
			ArgHome::Xmm(reg) => {
				a.load_x(reg, RBX, slot);
				// Win64 variadic floats additionally ride the positionally
				// paired gp register; the register number is the position
				// there, and always below four. Vectorcall has no variadic
				// form, so nothing to mirror.
				if sig.conv == CallConv::Win64 && sig.is_variadic() && i as u8 >= sig.var_index {
					a.movq_rx(WIN_GP[reg as usize], reg);
				}
			}
			ArgHome::Stack(off) => {
				a.load(RAX, RBX, slot);
				a.store(RSP, out_base + off, RAX);
			}
		}
	}

	if !windows && sig.is_variadic() {
		// the SysV vararg protocol wants the xmm count in al
		a.mov_ri32(RAX, fp_in_regs as u32);
	}

	a.mov_ri64(R10, target as u64);
	a.call_reg(R10);

	// store the native return into the two-slot return buffer
	match sig.ret {
		TypeSlot::Void => {}
		TypeSlot::Float | TypeSlot::Double => a.store_x(R12, 0, 0),
		TypeSlot::Vec2F => {
			if windows {
				a.store(R12, 0, RAX);
			} else {
				a.store_x(R12, 0, 0);
			}
		}
		TypeSlot::Vec3F | TypeSlot::Vec4F => {
			if windows {
				return Err(JitError::BadReturn(sig.ret));
			}
			a.store_x(R12, 0, 0);
			a.store_x(R12, 8, 1);
		}
		ret if ret.is_int() => {
			a.widen_rax(ret);
			a.store(R12, 0, RAX);
		}
		ret => return Err(JitError::BadReturn(ret)),
	}

	a.add_rsp(outgoing);
	a.pop(R12);
	a.pop(RBX);
	a.pop(RBP);
	a.ret();

	Ok(a.buf)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::sig::NO_VAR_ARGS;

	#[test]
	fn test_basic_encodings() {
		let mut a = Asm::new();
		a.push(RBP);
		a.mov_rr(RBP, RSP);
		assert_eq!(a.buf, vec![0x55, 0x48, 0x89, 0xE5]);

		let mut a = Asm::new();
		a.sub_rsp(0x40);
		assert_eq!(a.buf, vec![0x48, 0x81, 0xEC, 0x40, 0, 0, 0]);

		let mut a = Asm::new();
		a.mov_ri64(RAX, 0x1122334455667788);
		assert_eq!(a.buf, vec![0x48, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);

		let mut a = Asm::new();
		a.call_reg(R10);
		assert_eq!(a.buf, vec![0x41, 0xFF, 0xD2]);
	}

	#[test]
	fn test_memory_encodings() {
		// mov rax, [rbp - 8]
		let mut a = Asm::new();
		a.load(RAX, RBP, -8);
		assert_eq!(a.buf, vec![0x48, 0x8B, 0x85, 0xF8, 0xFF, 0xFF, 0xFF]);

		// mov [rsp + 32], rax needs a SIB byte
		let mut a = Asm::new();
		a.store(RSP, 32, RAX);
		assert_eq!(a.buf, vec![0x48, 0x89, 0x84, 0x24, 0x20, 0, 0, 0]);

		// mov [r12], rax also goes through the SIB path
		let mut a = Asm::new();
		a.store(R12, 0, RAX);
		assert_eq!(a.buf, vec![0x49, 0x89, 0x84, 0x24, 0, 0, 0, 0]);

		// movq xmm0, [rbp - 16]
		let mut a = Asm::new();
		a.load_x(0, RBP, -16);
		assert_eq!(a.buf, vec![0xF3, 0x0F, 0x7E, 0x85, 0xF0, 0xFF, 0xFF, 0xFF]);

		// movq [rbp - 16], xmm1
		let mut a = Asm::new();
		a.store_x(RBP, -16, 1);
		assert_eq!(a.buf, vec![0x66, 0x0F, 0xD6, 0x8D, 0xF0, 0xFF, 0xFF, 0xFF]);
	}

	#[test]
	fn test_home_assignment_sysv() {
		let mut sig = FuncSignature::new(CallConv::SysV64, NO_VAR_ARGS, TypeSlot::Void);
		for _ in 0..7 {
			sig.push_arg(TypeSlot::Int64);
		}
		sig.push_arg(TypeSlot::Double);
		let (homes, fp, stack) = assign_homes(&sig).unwrap();
		assert!(matches!(homes[0], ArgHome::Gp(r) if r == RDI));
		assert!(matches!(homes[5], ArgHome::Gp(r) if r == R9));
		assert!(matches!(homes[6], ArgHome::Stack(0)));
		assert!(matches!(homes[7], ArgHome::Xmm(0)));
		assert_eq!(fp, 1);
		assert_eq!(stack, 8);
	}

	#[test]
	fn test_home_assignment_win64_is_positional() {
		let mut sig = FuncSignature::new(CallConv::Win64, NO_VAR_ARGS, TypeSlot::Void);
		sig.push_arg(TypeSlot::Int32);
		sig.push_arg(TypeSlot::Float);
		sig.push_arg(TypeSlot::Pointer);
		sig.push_arg(TypeSlot::Double);
		sig.push_arg(TypeSlot::Int32);
		let (homes, fp, stack) = assign_homes(&sig).unwrap();
		assert!(matches!(homes[0], ArgHome::Gp(r) if r == RCX));
		assert!(matches!(homes[1], ArgHome::Xmm(1)));
		assert!(matches!(homes[2], ArgHome::Gp(r) if r == R8));
		assert!(matches!(homes[3], ArgHome::Xmm(3)));
		assert!(matches!(homes[4], ArgHome::Stack(0)));
		assert_eq!(fp, 2);
		assert_eq!(stack, 8);
	}

	#[test]
	fn test_home_assignment_vectorcall_counts_files_independently() {
		let mut sig = FuncSignature::new(CallConv::Vectorcall, NO_VAR_ARGS, TypeSlot::Void);
		// alternating classes would starve both files under the positional rule
		for _ in 0..6 {
			sig.push_arg(TypeSlot::Float);
			sig.push_arg(TypeSlot::Int64);
		}
		let (homes, fp, stack) = assign_homes(&sig).unwrap();

		// six floats fill xmm0-xmm5 regardless of their positions
		assert!(matches!(homes[0], ArgHome::Xmm(0)));
		assert!(matches!(homes[4], ArgHome::Xmm(2)));
		assert!(matches!(homes[10], ArgHome::Xmm(5)));
		// integers walk rcx, rdx, r8, r9 on their own counter, then spill
		assert!(matches!(homes[1], ArgHome::Gp(r) if r == RCX));
		assert!(matches!(homes[3], ArgHome::Gp(r) if r == RDX));
		assert!(matches!(homes[7], ArgHome::Gp(r) if r == R9));
		assert!(matches!(homes[9], ArgHome::Stack(0)));
		assert!(matches!(homes[11], ArgHome::Stack(8)));
		assert_eq!(fp, 6);
		assert_eq!(stack, 16);
	}

	#[test]
	fn test_home_assignment_vectorcall_float_overflow() {
		let mut sig = FuncSignature::new(CallConv::Vectorcall, NO_VAR_ARGS, TypeSlot::Void);
		for _ in 0..7 {
			sig.push_arg(TypeSlot::Double);
		}
		let (homes, fp, stack) = assign_homes(&sig).unwrap();
		assert!(matches!(homes[5], ArgHome::Xmm(5)));
		// the seventh float goes to the stack, win64 would already have
		// spilled the fifth
		assert!(matches!(homes[6], ArgHome::Stack(0)));
		assert_eq!(fp, 6);
		assert_eq!(stack, 8);
	}

	#[test]
	fn test_vectorcall_emit_handles_late_floats() {
		// floats homed past position four used to reuse the positional
		// win64 pairing; make sure generation stays in bounds
		let mut sig = FuncSignature::new(CallConv::Vectorcall, 5, TypeSlot::Void);
		for _ in 0..5 {
			sig.push_arg(TypeSlot::Int64);
		}
		sig.push_arg(TypeSlot::Double);
		assert!(emit_call(&sig, 0x1000, WaitType::None, false).is_ok());
	}

	#[test]
	fn test_wide_parameter_rejected() {
		let mut sig = FuncSignature::new(CallConv::SysV64, NO_VAR_ARGS, TypeSlot::Void);
		sig.push_arg(TypeSlot::Vec4F);
		assert!(matches!(assign_homes(&sig), Err(JitError::WideParameter)));
	}
}
