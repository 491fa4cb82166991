pub mod samples {
    use iced_x86::{Decoder, DecoderOptions, code_asm::*};

    /// Assemble the code emitted by `f` at `base`, returning the machine code and the address of
    /// each instruction.
    pub fn assemble(base: u64, f: impl FnOnce(&mut CodeAssembler)) -> (Vec<u8>, Vec<u64>) {
        let mut asm = CodeAssembler::new(64).unwrap();
        f(&mut asm);
        let code = asm.assemble(base).unwrap();

        let mut decoder = Decoder::with_ip(64, &code, base, DecoderOptions::NONE);
        let ips = decoder.iter().map(|i| i.ip()).collect();
        (code, ips)
    }

    pub fn ror_decryptor_32(asm: &mut CodeAssembler) {
        asm.mov(eax, dword_ptr(rcx + 0x10)).unwrap();
        asm.xor(eax, 0x1234).unwrap();
        asm.ror(eax, 7).unwrap();
        asm.xor(eax, 0x5678).unwrap();
        asm.shl(eax, 3).unwrap();
    }

    pub fn rol_decryptor_64(asm: &mut CodeAssembler) {
        asm.mov(rax, qword_ptr(rcx + 8)).unwrap();
        asm.mov(rdx, 0x1122334455667788u64).unwrap();
        asm.xor(rax, rdx).unwrap();
        asm.rol(rax, 0x11).unwrap();
        asm.mov(rdx, rax).unwrap();
        asm.shl(rdx, 0x1d).unwrap();
        asm.xor(rdx, rax).unwrap();
        asm.mov(rax, 0x0102030405060708u64).unwrap();
        asm.xor(rax, rdx).unwrap();
    }

    /// Code laid out like the protected engine functions: the anchor followed by the name
    /// decryptors, the branch target holding the outer and class pointer decryptors, and finally
    /// the object index decryptor behind its signature.
    pub fn decryptor_image(asm: &mut CodeAssembler) {
        let mut object_pointers = asm.create_label();

        asm.test(r8, r8).unwrap();
        asm.setne(al).unwrap();
        asm.test(al, al).unwrap();
        asm.jne(object_pointers).unwrap();

        asm.mov(eax, dword_ptr(rbx + 0x10)).unwrap();
        asm.xor(eax, 0x3c1a5b7e).unwrap();
        asm.ror(eax, 7).unwrap();
        asm.mov(ecx, eax).unwrap();
        asm.shl(ecx, 3).unwrap();
        asm.xor(ecx, eax).unwrap();
        asm.xor(ecx, 0x1f2e3d4c).unwrap();
        asm.mov(dword_ptr(rsp + 0x20), ecx).unwrap();

        asm.mov(eax, dword_ptr(rbx + 0x14)).unwrap();
        asm.xor(eax, 0x55aa55aa).unwrap();
        asm.rol(eax, 5).unwrap();
        asm.mov(edx, eax).unwrap();
        asm.shl(edx, 9).unwrap();
        asm.xor(edx, eax).unwrap();
        asm.xor(edx, 0x0badf00d).unwrap();
        asm.mov(dword_ptr(rsp + 0x24), edx).unwrap();
        asm.cmp(dword_ptr(rsp + 0x20), 0).unwrap();
        asm.ret().unwrap();

        asm.set_label(&mut object_pointers).unwrap();
        asm.mov(rax, qword_ptr(rdi + 0x18)).unwrap();
        asm.mov(rdx, 0x7a6b5c4d3e2f1a0bu64).unwrap();
        asm.xor(rax, rdx).unwrap();
        asm.ror(rax, 0x13).unwrap();
        asm.mov(rdx, rax).unwrap();
        asm.shl(rdx, 0x1c).unwrap();
        asm.xor(rdx, rax).unwrap();
        asm.mov(rax, 0x1badb002deadbeefu64).unwrap();
        asm.xor(rax, rdx).unwrap();

        asm.mov(rcx, qword_ptr(rdi + 0x10)).unwrap();
        asm.mov(r8, 0x0f1e2d3c4b5a6978u64).unwrap();
        asm.xor(rcx, r8).unwrap();
        asm.rol(rcx, 0x0b).unwrap();
        asm.mov(r8, rcx).unwrap();
        asm.shr(r8, 7).unwrap();
        asm.xor(r8, rcx).unwrap();
        asm.mov(rcx, 0x2468ace013579bdfu64).unwrap();
        asm.xor(rcx, r8).unwrap();
        asm.ret().unwrap();

        // call; mov [rdi+0x100], rax; test rax, rax; jz; mov eax, [rax+0xc]
        asm.db(&[0xe8, 0, 0, 0, 0]).unwrap();
        asm.mov(qword_ptr(rdi + 0x100), rax).unwrap();
        asm.test(rax, rax).unwrap();
        asm.db(&[0x0f, 0x84, 0, 0, 0, 0]).unwrap();
        asm.mov(eax, dword_ptr(rax + 0x0c)).unwrap();
        asm.xor(eax, 0x600dcafe).unwrap();
        asm.ror(eax, 0x0f).unwrap();
        asm.mov(ecx, eax).unwrap();
        asm.shl(ecx, 0x10).unwrap();
        asm.xor(ecx, eax).unwrap();
        asm.xor(ecx, 0x13579bdf).unwrap();
    }
}
