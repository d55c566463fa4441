//! x86-64 System V instruction emitter.
//!
//! Each primitive appends the encoded bytes of one instruction to a
//! `Vec<u8>`. The register assignment is fixed by the emitted functions'
//! calling convention: `rdi` points at the variables array, `rsi` at the
//! call context's scratch RAM (aliased into `rbx` by the prologue so the
//! body can use a callee-saved base), and `rdx` at the unary math function
//! pointer table. All values are 8-byte `double`s moved through `xmm0` and
//! `xmm1` with `movsd` and the scalar SSE2 arithmetic forms.
//!
//! Slot arguments are indices into `double` arrays; the byte offset
//! (`index * 8`) is computed here and always encoded as disp32.

#[inline]
fn disp32(code: &mut Vec<u8>, index: usize) {
    let offset = index.checked_mul(8).expect("slot offset overflows");
    assert!(offset <= u32::MAX as usize, "slot offset exceeds disp32");
    code.extend_from_slice(&(offset as u32).to_le_bytes());
}

pub fn push_rbx(code: &mut Vec<u8>) {
    code.push(0x53);
}

pub fn pop_rbx(code: &mut Vec<u8>) {
    code.push(0x5B);
}

pub fn push_rdi(code: &mut Vec<u8>) {
    code.push(0x57);
}

pub fn pop_rdi(code: &mut Vec<u8>) {
    code.push(0x5F);
}

pub fn push_rdx(code: &mut Vec<u8>) {
    code.push(0x52);
}

pub fn pop_rdx(code: &mut Vec<u8>) {
    code.push(0x5A);
}

pub fn ret(code: &mut Vec<u8>) {
    code.push(0xC3);
}

/// `mov rbx, rsi` — alias the scratch pointer into the callee-saved base.
pub fn mov_rsi_rbx(code: &mut Vec<u8>) {
    code.extend_from_slice(&[0x48, 0x89, 0xF3]);
}

/// `movsd xmm0, [rbx + 8*index]`
pub fn load_from_memory_by_rbx_offset_to_xmm0(code: &mut Vec<u8>, index: usize) {
    code.extend_from_slice(&[0xF2, 0x0F, 0x10, 0x83]);
    disp32(code, index);
}

/// `movsd xmm1, [rbx + 8*index]`
pub fn load_from_memory_by_rbx_offset_to_xmm1(code: &mut Vec<u8>, index: usize) {
    code.extend_from_slice(&[0xF2, 0x0F, 0x10, 0x8B]);
    disp32(code, index);
}

/// `movsd xmm0, [rdi + 8*index]`
pub fn load_from_memory_by_rdi_offset_to_xmm0(code: &mut Vec<u8>, index: usize) {
    code.extend_from_slice(&[0xF2, 0x0F, 0x10, 0x87]);
    disp32(code, index);
}

/// `movsd xmm1, [rdi + 8*index]`
pub fn load_from_memory_by_rdi_offset_to_xmm1(code: &mut Vec<u8>, index: usize) {
    code.extend_from_slice(&[0xF2, 0x0F, 0x10, 0x8F]);
    disp32(code, index);
}

/// `movsd xmm0, [rsi + 8*index]` — for bodies that never set up `rbx`.
pub fn load_from_memory_by_rsi_offset_to_xmm0(code: &mut Vec<u8>, index: usize) {
    code.extend_from_slice(&[0xF2, 0x0F, 0x10, 0x86]);
    disp32(code, index);
}

/// `movsd xmm1, [rsi + 8*index]`
pub fn load_from_memory_by_rsi_offset_to_xmm1(code: &mut Vec<u8>, index: usize) {
    code.extend_from_slice(&[0xF2, 0x0F, 0x10, 0x8E]);
    disp32(code, index);
}

/// `movsd [rbx + 8*index], xmm0`
pub fn store_xmm0_to_memory_by_rbx_offset(code: &mut Vec<u8>, index: usize) {
    code.extend_from_slice(&[0xF2, 0x0F, 0x11, 0x83]);
    disp32(code, index);
}

/// `mov rax, imm64; movq xmm0, rax`
pub fn load_immediate_to_xmm0(code: &mut Vec<u8>, value: f64) {
    code.extend_from_slice(&[0x48, 0xB8]);
    code.extend_from_slice(&value.to_bits().to_le_bytes());
    code.extend_from_slice(&[0x66, 0x48, 0x0F, 0x6E, 0xC0]);
}

/// `mov rax, imm64; movq xmm1, rax`
pub fn load_immediate_to_xmm1(code: &mut Vec<u8>, value: f64) {
    code.extend_from_slice(&[0x48, 0xB8]);
    code.extend_from_slice(&value.to_bits().to_le_bytes());
    code.extend_from_slice(&[0x66, 0x48, 0x0F, 0x6E, 0xC8]);
}

/// `mov rax, imm64; mov [rbx + 8*index], rax`
pub fn load_immediate_to_memory_by_rbx_offset(code: &mut Vec<u8>, index: usize, value: f64) {
    code.extend_from_slice(&[0x48, 0xB8]);
    code.extend_from_slice(&value.to_bits().to_le_bytes());
    code.extend_from_slice(&[0x48, 0x89, 0x83]);
    disp32(code, index);
}

/// `addsd xmm0, [rbx + 8*index]`
pub fn add_from_memory_by_rbx_offset_to_xmm0(code: &mut Vec<u8>, index: usize) {
    code.extend_from_slice(&[0xF2, 0x0F, 0x58, 0x83]);
    disp32(code, index);
}

/// `subsd xmm0, [rbx + 8*index]`
pub fn sub_from_memory_by_rbx_offset_to_xmm0(code: &mut Vec<u8>, index: usize) {
    code.extend_from_slice(&[0xF2, 0x0F, 0x5C, 0x83]);
    disp32(code, index);
}

/// `mulsd xmm0, [rbx + 8*index]`
pub fn mul_from_memory_by_rbx_offset_to_xmm0(code: &mut Vec<u8>, index: usize) {
    code.extend_from_slice(&[0xF2, 0x0F, 0x59, 0x83]);
    disp32(code, index);
}

/// `divsd xmm0, [rbx + 8*index]`
pub fn div_from_memory_by_rbx_offset_to_xmm0(code: &mut Vec<u8>, index: usize) {
    code.extend_from_slice(&[0xF2, 0x0F, 0x5E, 0x83]);
    disp32(code, index);
}

/// `addsd xmm0, [rdi + 8*index]`
pub fn add_from_memory_by_rdi_offset_to_xmm0(code: &mut Vec<u8>, index: usize) {
    code.extend_from_slice(&[0xF2, 0x0F, 0x58, 0x87]);
    disp32(code, index);
}

/// `subsd xmm0, [rdi + 8*index]`
pub fn sub_from_memory_by_rdi_offset_to_xmm0(code: &mut Vec<u8>, index: usize) {
    code.extend_from_slice(&[0xF2, 0x0F, 0x5C, 0x87]);
    disp32(code, index);
}

/// `mulsd xmm0, [rdi + 8*index]`
pub fn mul_from_memory_by_rdi_offset_to_xmm0(code: &mut Vec<u8>, index: usize) {
    code.extend_from_slice(&[0xF2, 0x0F, 0x59, 0x87]);
    disp32(code, index);
}

/// `divsd xmm0, [rdi + 8*index]`
pub fn div_from_memory_by_rdi_offset_to_xmm0(code: &mut Vec<u8>, index: usize) {
    code.extend_from_slice(&[0xF2, 0x0F, 0x5E, 0x87]);
    disp32(code, index);
}

/// `addsd xmm0, xmm1`
pub fn add_xmm1_xmm0(code: &mut Vec<u8>) {
    code.extend_from_slice(&[0xF2, 0x0F, 0x58, 0xC1]);
}

/// `subsd xmm0, xmm1`
pub fn sub_xmm1_xmm0(code: &mut Vec<u8>) {
    code.extend_from_slice(&[0xF2, 0x0F, 0x5C, 0xC1]);
}

/// `mulsd xmm0, xmm1`
pub fn mul_xmm1_xmm0(code: &mut Vec<u8>) {
    code.extend_from_slice(&[0xF2, 0x0F, 0x59, 0xC1]);
}

/// `divsd xmm0, xmm1`
pub fn div_xmm1_xmm0(code: &mut Vec<u8>) {
    code.extend_from_slice(&[0xF2, 0x0F, 0x5E, 0xC1]);
}

/// `call qword ptr [rdx + 8*index]` — invoke a unary math function from the
/// pointer table. The argument and the result travel in `xmm0`. The caller
/// is responsible for saving `rdi`/`rdx` around the call and for keeping the
/// stack 16-byte aligned at the call site.
pub fn call_function_from_rdx_pointers_array_by_index(code: &mut Vec<u8>, index: u8) {
    code.extend_from_slice(&[0xFF, 0x92]);
    disp32(code, index as usize);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_byte_stack_ops() {
        let mut code = Vec::new();
        push_rbx(&mut code);
        pop_rbx(&mut code);
        push_rdi(&mut code);
        pop_rdi(&mut code);
        push_rdx(&mut code);
        pop_rdx(&mut code);
        ret(&mut code);
        assert_eq!(code, [0x53, 0x5B, 0x57, 0x5F, 0x52, 0x5A, 0xC3]);
    }

    #[test]
    fn movsd_load_encodes_the_scaled_offset() {
        let mut code = Vec::new();
        load_from_memory_by_rbx_offset_to_xmm0(&mut code, 3);
        assert_eq!(code, [0xF2, 0x0F, 0x10, 0x83, 24, 0, 0, 0]);
    }

    #[test]
    fn immediate_load_embeds_the_double_bits() {
        let mut code = Vec::new();
        load_immediate_to_xmm0(&mut code, 1.5);
        assert_eq!(&code[..2], &[0x48, 0xB8]);
        assert_eq!(&code[2..10], &1.5f64.to_bits().to_le_bytes());
        assert_eq!(&code[10..], &[0x66, 0x48, 0x0F, 0x6E, 0xC0]);
    }

    #[test]
    fn fused_arithmetic_differs_only_in_the_opcode_byte() {
        let mut add = Vec::new();
        let mut sub = Vec::new();
        let mut mul = Vec::new();
        let mut div = Vec::new();
        add_from_memory_by_rdi_offset_to_xmm0(&mut add, 1);
        sub_from_memory_by_rdi_offset_to_xmm0(&mut sub, 1);
        mul_from_memory_by_rdi_offset_to_xmm0(&mut mul, 1);
        div_from_memory_by_rdi_offset_to_xmm0(&mut div, 1);
        assert_eq!(add[2], 0x58);
        assert_eq!(sub[2], 0x5C);
        assert_eq!(mul[2], 0x59);
        assert_eq!(div[2], 0x5E);
        for code in [&add, &sub, &mul, &div] {
            assert_eq!(code[3], 0x87);
            assert_eq!(&code[4..], &[8, 0, 0, 0]);
        }
    }

    #[test]
    fn table_call_scales_the_function_index() {
        let mut code = Vec::new();
        call_function_from_rdx_pointers_array_by_index(&mut code, 5);
        assert_eq!(code, [0xFF, 0x92, 40, 0, 0, 0]);
    }
}
