//! Program execution
//!
//! exec reads an image, recognizes one level of shebang indirection,
//! loads the ELF into a freshly created address space with a re-rolled
//! ASLR base, builds the initial stack (argc/argv/envp, SysV layout),
//! and replaces the process's threads with a single thread at the
//! entry point. Failure anywhere before the final installation leaves
//! the process exactly as it was.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::arch::context::TrapFrame;
use crate::arch::paging::MapPermissions;
use crate::error::{Errno, KResult};
use crate::fs::mount;
use crate::mac::Permissions;
use crate::mm::AddressSpace;
use crate::uaccess;

use super::proc;
use super::sched;
use super::{Pid, Tid};

/// Highest stack address handed to new programs.
const STACK_TOP: u64 = 0x0000_7FFF_FFF0_0000;

/// Bound on the argv/envp block.
const MAX_ARG_BYTES: usize = 64 * 1024;

/// Read a whole file through the VFS.
fn read_file(path: &str) -> KResult<Vec<u8>> {
    let (_handle, fs, relative) = mount::resolve(path)?;
    let ino = fs.open(&relative).map_err(Errno::from)?;
    let stat = fs.stat(ino).map_err(Errno::from)?;

    let mut image = alloc::vec![0u8; stat.byte_size as usize];
    let mut done = 0usize;
    while done < image.len() {
        let n = fs
            .read(ino, done as u64, &mut image[done..])
            .map_err(Errno::from)?;
        if n == 0 {
            break;
        }
        done += n;
    }
    fs.close(ino);
    image.truncate(done);
    Ok(image)
}

/// Lay out argc/argv/envp at the top of the stack mapping. Returns
/// the initial stack pointer.
fn build_stack(
    space: &AddressSpace,
    argv: &[String],
    envp: &[String],
) -> KResult<(u64, u64, u64)> {
    let total_strings: usize = argv.iter().chain(envp.iter()).map(|s| s.len() + 1).sum();
    if total_strings > MAX_ARG_BYTES {
        return Err(Errno::StringTooLong);
    }

    // Strings grow down from the top; pointer arrays sit below them.
    let mut cursor = STACK_TOP;
    let mut argv_ptrs = Vec::with_capacity(argv.len());
    let mut envp_ptrs = Vec::with_capacity(envp.len());

    for s in argv {
        cursor -= s.len() as u64 + 1;
        argv_ptrs.push(cursor);
        uaccess::copy_to_user(space, cursor, s.as_bytes())?;
        uaccess::copy_to_user(space, cursor + s.len() as u64, &[0])?;
    }
    for s in envp {
        cursor -= s.len() as u64 + 1;
        envp_ptrs.push(cursor);
        uaccess::copy_to_user(space, cursor, s.as_bytes())?;
        uaccess::copy_to_user(space, cursor + s.len() as u64, &[0])?;
    }

    // Align, then: argc, argv[..], NULL, envp[..], NULL — with argc
    // at the final stack pointer.
    let words = 1 + argv_ptrs.len() + 1 + envp_ptrs.len() + 1;
    cursor &= !0xF;
    cursor -= (words as u64) * 8;
    cursor &= !0xF;

    let mut at = cursor;
    uaccess::write_user_u64(space, at, argv.len() as u64)?;
    at += 8;
    let argv_base = at;
    for ptr in &argv_ptrs {
        uaccess::write_user_u64(space, at, *ptr)?;
        at += 8;
    }
    uaccess::write_user_u64(space, at, 0)?;
    at += 8;
    let envp_base = at;
    for ptr in &envp_ptrs {
        uaccess::write_user_u64(space, at, *ptr)?;
        at += 8;
    }
    uaccess::write_user_u64(space, at, 0)?;

    Ok((cursor, argv_base, envp_base))
}

/// Execute `path` in process `pid`: new address space, new single
/// thread. Returns the new TID; the caller retires the calling
/// thread when it belongs to `pid`.
pub fn exec_process(
    pid: Pid,
    path: &str,
    mut argv: Vec<String>,
    envp: Vec<String>,
) -> KResult<Tid> {
    // MAC: the caller needs execute rights on the path
    let allowed = proc::with_process(pid, |p| p.mac.check_path(path, Permissions::EXEC))?;
    if !allowed {
        return Err(Errno::BadAccess);
    }

    let mut image = read_file(path)?;
    let mut exec_path = String::from(path);

    // One level of interpreter indirection
    if let Some((interpreter, argument)) = crate::elf::parse_shebang(&image) {
        let mut new_argv = Vec::with_capacity(argv.len() + 2);
        new_argv.push(interpreter.clone());
        if let Some(arg) = argument {
            new_argv.push(arg);
        }
        new_argv.push(String::from(path));
        new_argv.extend(argv.drain(..).skip(1));
        argv = new_argv;

        image = read_file(&interpreter)?;
        exec_path = interpreter;
    }

    let space = Arc::new(AddressSpace::new_user().ok_or(Errno::NoMemory)?);

    // Fresh randomization for every image
    let base = crate::random::aslr_base();
    let loaded = crate::elf::load(&space, &image, base)?;

    let stack_size = proc::with_process(pid, |p| p.limits.stack_size)?;
    let stack_bottom = STACK_TOP - stack_size;
    space.map_allocated_range(
        stack_bottom,
        stack_size,
        MapPermissions::USER | MapPermissions::WRITE,
    )?;

    if argv.is_empty() {
        argv.push(exec_path.clone());
    }
    let (stack_ptr, argv_base, envp_base) = build_stack(&space, &argv, &envp)?;

    let mut frame = TrapFrame::new_user(loaded.entry, stack_ptr);
    #[cfg(target_arch = "x86_64")]
    {
        frame.rdi = argv.len() as u64;
        frame.rsi = argv_base;
        frame.rdx = envp_base;
    }
    #[cfg(target_arch = "riscv64")]
    {
        frame.regs[9] = argv.len() as u64; // a0
        frame.regs[10] = argv_base; // a1
        frame.regs[11] = envp_base; // a2
    }

    // Point of no return: retire the old threads, swap the space,
    // sweep close-on-exec descriptors, start the new thread.
    //
    // Hold the old space until the core has moved off it; dropping
    // the last reference frees its frames.
    let old_space = proc::current_space(pid)?;
    let old_threads = proc::with_process(pid, |p| core::mem::take(&mut p.threads))?;
    for tid in old_threads {
        if tid != proc::current_tid() {
            let _ = sched::delete_thread(tid);
        }
    }

    let map_root = space.root();
    proc::with_process(pid, |p| {
        p.space = space.clone();
        p.fds.exec_sweep();
        p.identifier = exec_path.clone();
    })?;

    let tid = sched::create_user_thread(pid, map_root, frame, 1, 0);
    if tid == 0 {
        return Err(Errno::NoMemory);
    }
    proc::with_process(pid, |p| p.threads.push(tid))?;

    // When the caller execs itself, move this core onto the new map
    // (the kernel half is identical) so the old one can be freed.
    if pid == proc::current_pid() {
        space.make_active();
    }
    drop(old_space);

    Ok(tid)
}
