//! Machine-context switching.
//!
//! One primitive, [`Context::switch`], saves the callee-saved register set
//! and stack pointer of the running context and restores another. The
//! first run of a job goes through a separate path: the job's stack is
//! prepared so that the very first switch into it "returns" into a
//! trampoline that enters [`task_main`](super::job::task_main) with the job
//! pointer in a callee-saved register.

use super::job::Job;

/// Saved machine context: just the stack pointer. Everything else lives in
/// the frame the switch pushed onto that stack.
#[repr(C)]
pub(super) struct Context {
    sp: *mut u8,
}

impl Context {
    pub(super) fn empty() -> Self {
        Context {
            sp: std::ptr::null_mut(),
        }
    }

    /// Save the current context into `save` and resume `target`.
    ///
    /// # Safety
    /// `save` must stay valid until the context is resumed; `target` must
    /// hold a context prepared by this function or by
    /// [`Context::prepare_first_run`], and no other thread may resume it
    /// concurrently.
    pub(super) unsafe fn switch(save: *mut Context, target: *const Context) {
        unsafe { context_switch(save, target) }
    }

    /// Build the initial frame on `stack` so that the first switch into
    /// this context enters the trampoline with `job` in hand.
    pub(super) fn prepare_first_run(&mut self, stack: &mut [u8], job: *mut Job) {
        let top = {
            let end = stack.as_mut_ptr() as usize + stack.len();
            (end & !15) as *mut u8
        };

        // Frame layout matches the restore order of `context_switch`; on
        // x86-64 the trailing `ret` lands in the trampoline with rsp at
        // `top`, so its `call` leaves the stack with standard SysV entry
        // alignment.
        #[cfg(target_arch = "x86_64")]
        unsafe {
            // r15 r14 r13 r12 rbx rbp <return>; r15 carries the job.
            let frame = top.sub(7 * 8) as *mut u64;
            frame.write(job as u64); // r15
            frame.add(1).write(0); // r14
            frame.add(2).write(0); // r13
            frame.add(3).write(0); // r12
            frame.add(4).write(0); // rbx
            frame.add(5).write(0); // rbp
            frame
                .add(6)
                .write(job_trampoline as unsafe extern "C" fn() as usize as u64);
            self.sp = frame as *mut u8;
        }

        #[cfg(target_arch = "aarch64")]
        unsafe {
            // x19 x20 .. x28 x29 x30 d8..d15; x19 carries the job, x30 the
            // trampoline.
            let frame = top.sub(20 * 8) as *mut u64;
            for slot in 0..20 {
                frame.add(slot).write(0);
            }
            frame.write(job as u64); // x19
            frame
                .add(11)
                .write(job_trampoline as unsafe extern "C" fn() as usize as u64); // x30
            self.sp = frame as *mut u8;
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        #[unsafe(naked)]
        unsafe extern "C" fn context_switch(_save: *mut Context, _target: *const Context) {
            core::arch::naked_asm!(
                "push rbp",
                "push rbx",
                "push r12",
                "push r13",
                "push r14",
                "push r15",
                "mov [rdi], rsp",
                "mov rsp, [rsi]",
                "pop r15",
                "pop r14",
                "pop r13",
                "pop r12",
                "pop rbx",
                "pop rbp",
                "ret",
            )
        }

        #[unsafe(naked)]
        unsafe extern "C" fn job_trampoline() {
            core::arch::naked_asm!(
                "mov rdi, r15",
                "call {main}",
                "ud2",
                main = sym super::job::task_main,
            )
        }
    } else if #[cfg(target_arch = "aarch64")] {
        #[unsafe(naked)]
        unsafe extern "C" fn context_switch(_save: *mut Context, _target: *const Context) {
            core::arch::naked_asm!(
                "sub sp, sp, #160",
                "stp x19, x20, [sp, #0]",
                "stp x21, x22, [sp, #16]",
                "stp x23, x24, [sp, #32]",
                "stp x25, x26, [sp, #48]",
                "stp x27, x28, [sp, #64]",
                "stp x29, x30, [sp, #80]",
                "stp d8, d9, [sp, #96]",
                "stp d10, d11, [sp, #112]",
                "stp d12, d13, [sp, #128]",
                "stp d14, d15, [sp, #144]",
                "mov x2, sp",
                "str x2, [x0]",
                "ldr x2, [x1]",
                "mov sp, x2",
                "ldp x19, x20, [sp, #0]",
                "ldp x21, x22, [sp, #16]",
                "ldp x23, x24, [sp, #32]",
                "ldp x25, x26, [sp, #48]",
                "ldp x27, x28, [sp, #64]",
                "ldp x29, x30, [sp, #80]",
                "ldp d8, d9, [sp, #96]",
                "ldp d10, d11, [sp, #112]",
                "ldp d12, d13, [sp, #128]",
                "ldp d14, d15, [sp, #144]",
                "add sp, sp, #160",
                "ret",
            )
        }

        #[unsafe(naked)]
        unsafe extern "C" fn job_trampoline() {
            core::arch::naked_asm!(
                "mov x0, x19",
                "bl {main}",
                "brk #0",
                main = sym super::job::task_main,
            )
        }
    } else {
        compile_error!("unimplemented architecture for the userspace scheduler");
    }
}
