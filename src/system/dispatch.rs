//! Syscall numbering.
//!
//! The surface is a fixed table of 111 slots in grouped ranges: debug (0),
//! process/thread (1..=30), synchronization (31..=40), memory (41..=50),
//! path and file mappings (51..=60), IPC (61..=70), system (71..=80), ACPI
//! (81..=90), I/O space (91..=94), driver support (95..=100) and
//! interrupts/timers (101..). Slots without an operation route to the
//! no-op.

pub const SYSCALL_TABLE_SIZE: usize = 111;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum SyscallNumber {
    Debug = 0,

    // Process and thread functions.
    ProcessSpawn = 1,
    ProcessJoin = 2,
    ProcessKill = 3,
    ProcessExit = 4,
    ProcessGetCurrentId = 5,
    ProcessSignal = 6,
    ProcessRaise = 7,
    ProcessGetStartupInformation = 8,
    SharedObjectLoad = 9,
    SharedObjectGetFunction = 10,
    SharedObjectUnload = 11,
    ThreadCreate = 12,
    ThreadExit = 13,
    ThreadSignal = 14,
    ThreadJoin = 15,
    ThreadSleep = 16,
    ThreadYield = 17,
    ThreadGetCurrentId = 18,
    ThreadSetCurrentName = 19,
    ThreadGetCurrentName = 20,

    // Memory functions.
    MemoryAllocate = 41,
    MemoryFree = 42,
    MemoryQuery = 43,
    MemoryAcquire = 44,
    MemoryRelease = 45,
    MemoryProtect = 46,

    // Path and file-mapping functions.
    GetWorkingDirectory = 51,
    SetWorkingDirectory = 52,
    GetAssemblyDirectory = 53,
    CreateFileMapping = 54,
    DestroyFileMapping = 55,
    FlushFileMapping = 56,

    // IPC functions.
    PipeOpen = 61,
    PipeClose = 62,
    PipeRead = 63,
    PipeWrite = 64,
    IpcSleep = 65,
    IpcWake = 66,
    RpcExecute = 67,
    RpcResponse = 68,
    RpcListen = 69,
    RpcRespond = 70,

    // System functions.
    SystemTick = 74,

    /// Every unassigned slot.
    NoOperation = 110,
}

/// The fixed handler table; unused slots carry [`SyscallNumber::NoOperation`].
pub fn syscall_table() -> [SyscallNumber; SYSCALL_TABLE_SIZE] {
    use SyscallNumber::*;
    let mut table = [NoOperation; SYSCALL_TABLE_SIZE];
    let assigned = [
        Debug,
        ProcessSpawn,
        ProcessJoin,
        ProcessKill,
        ProcessExit,
        ProcessGetCurrentId,
        ProcessSignal,
        ProcessRaise,
        ProcessGetStartupInformation,
        SharedObjectLoad,
        SharedObjectGetFunction,
        SharedObjectUnload,
        ThreadCreate,
        ThreadExit,
        ThreadSignal,
        ThreadJoin,
        ThreadSleep,
        ThreadYield,
        ThreadGetCurrentId,
        ThreadSetCurrentName,
        ThreadGetCurrentName,
        MemoryAllocate,
        MemoryFree,
        MemoryQuery,
        MemoryAcquire,
        MemoryRelease,
        MemoryProtect,
        GetWorkingDirectory,
        SetWorkingDirectory,
        GetAssemblyDirectory,
        CreateFileMapping,
        DestroyFileMapping,
        FlushFileMapping,
        PipeOpen,
        PipeClose,
        PipeRead,
        PipeWrite,
        IpcSleep,
        IpcWake,
        RpcExecute,
        RpcResponse,
        RpcListen,
        RpcRespond,
        SystemTick,
    ];
    for number in assigned {
        table[number as usize] = number;
    }
    table
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn numbers_stay_in_their_groups() {
        assert_eq!(SyscallNumber::Debug as usize, 0);
        for process_or_thread in [
            SyscallNumber::ProcessSpawn,
            SyscallNumber::ThreadGetCurrentName,
        ] {
            let index = process_or_thread as usize;
            assert!((1..=30).contains(&index));
        }
        assert!((41..=50).contains(&(SyscallNumber::MemoryProtect as usize)));
        assert!((51..=60).contains(&(SyscallNumber::DestroyFileMapping as usize)));
        assert!((61..=70).contains(&(SyscallNumber::RpcRespond as usize)));
        assert!((71..=80).contains(&(SyscallNumber::SystemTick as usize)));
    }

    #[test]
    fn unused_slots_route_to_the_noop() {
        let table = syscall_table();
        assert_eq!(table.len(), SYSCALL_TABLE_SIZE);
        // The ACPI and I/O-space groups are unimplemented collaborator
        // surface; every slot must still dispatch somewhere.
        for index in 81..=100 {
            assert_eq!(table[index], SyscallNumber::NoOperation);
        }
        assert_eq!(table[SyscallNumber::PipeOpen as usize], SyscallNumber::PipeOpen);
    }
}
