//! Windows backend (spec.md §4.1, §4.4): suspended process creation, job
//! objects for resource accounting, and the desktop isolation / DLL
//! injection paths used when the caller asks for them.

use std::mem::size_of;
use std::os::windows::ffi::OsStrExt;
use std::path::Path;
use std::time::{Duration, Instant};

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
use windows_sys::Win32::Security::{LogonUserW, LOGON32_LOGON_INTERACTIVE, LOGON32_PROVIDER_DEFAULT};
use windows_sys::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, JobObjectBasicUIRestrictions,
    JobObjectExtendedLimitInformation, QueryInformationJobObject, SetInformationJobObject,
    JOBOBJECT_BASIC_ACCOUNTING_INFORMATION, JOBOBJECT_BASIC_UI_RESTRICTIONS,
    JOBOBJECT_EXTENDED_LIMIT_INFORMATION, JOB_OBJECT_LIMIT_ACTIVE_PROCESS,
    JOB_OBJECT_LIMIT_DIE_ON_UNHANDLED_EXCEPTION, JOB_OBJECT_LIMIT_JOB_MEMORY,
    JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE, JOB_OBJECT_LIMIT_PROCESS_TIME,
    JOB_OBJECT_UILIMIT_DESKTOP, JOB_OBJECT_UILIMIT_DISPLAYSETTINGS,
    JOB_OBJECT_UILIMIT_EXITWINDOWS, JOB_OBJECT_UILIMIT_GLOBALATOMS, JOB_OBJECT_UILIMIT_HANDLES,
    JOB_OBJECT_UILIMIT_READCLIPBOARD, JOB_OBJECT_UILIMIT_SYSTEMPARAMETERS,
    JOB_OBJECT_UILIMIT_WRITECLIPBOARD,
};
use windows_sys::Win32::System::ProcessStatus::{GetProcessMemoryInfo, PROCESS_MEMORY_COUNTERS};
use windows_sys::Win32::System::Memory::{
    VirtualAllocEx, VirtualFreeEx, MEM_COMMIT, MEM_RELEASE, PAGE_READWRITE,
};
use windows_sys::Win32::System::StationsAndDesktops::{CloseDesktop, CreateDesktopW, HDESK};
use windows_sys::Win32::System::Threading::{
    CreateProcessAsUserW, CreateProcessW, CreateRemoteThread, GetProcessTimes, ResumeThread,
    SetProcessAffinityMask, TerminateProcess, WaitForSingleObject, ABOVE_NORMAL_PRIORITY_CLASS,
    CREATE_BREAKAWAY_FROM_JOB, CREATE_NEW_CONSOLE, CREATE_NEW_PROCESS_GROUP, CREATE_SUSPENDED,
    CREATE_UNICODE_ENVIRONMENT, INFINITE, PROCESS_INFORMATION, STARTUPINFOW,
};

use crate::error::{self, Error, Result};
use crate::identity::Identity;
use crate::memory::MemorySize;
use crate::redirect::{self, StdStream};
use crate::spec::SubprocessSpec;

use super::{ExitObservation, FrozenProcessHandle, RunningProcessHandle, Usage};

/// Full access rights requested on a desktop created for UI-restricted runs.
/// Matches `GENERIC_ALL` without depending on whichever `windows-sys`
/// feature module happens to re-export it.
const DESKTOP_GENERIC_ALL: u32 = 0x1000_0000;

/// A desktop created for UI-restricted runs (spec.md §4.4, `restrict_ui`):
/// the judged process is started with `STARTUPINFOW::lpDesktop` pointing at
/// it, so window creation, clipboard access, and desktop switching stay
/// confined to a desktop no interactive user session is displaying.
pub struct DesktopHandle {
    name: String,
    handle: HDESK,
}

impl DesktopHandle {
    /// Create an isolated desktop on the non-interactive `Winsta0` window
    /// station. The handle is closed on drop; the desktop object itself
    /// persists until every process started on it has also exited.
    pub fn create() -> Result<DesktopHandle> {
        let leaf = format!("sandrun-{}", std::process::id());
        let leaf_wide = to_wide(&leaf);
        let handle = unsafe {
            CreateDesktopW(
                leaf_wide.as_ptr(),
                std::ptr::null(),
                std::ptr::null(),
                0,
                DESKTOP_GENERIC_ALL,
                std::ptr::null(),
            )
        };
        if handle == 0 {
            return Err(error::os_error(
                "CreateDesktopW",
                std::io::Error::last_os_error().raw_os_error().unwrap_or(-1),
            ));
        }

        Ok(DesktopHandle {
            name: format!("Winsta0\\{}", leaf),
            handle,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for DesktopHandle {
    fn drop(&mut self) {
        unsafe {
            CloseDesktop(self.handle);
        }
    }
}

unsafe impl Send for DesktopHandle {}
unsafe impl Sync for DesktopHandle {}

fn to_wide(s: &str) -> Vec<u16> {
    std::ffi::OsStr::new(s)
        .encode_wide()
        .chain(std::iter::once(0))
        .collect()
}

fn filetime_to_duration(high: u32, low: u32) -> Duration {
    let ticks = ((high as u64) << 32) | (low as u64);
    Duration::from_nanos(ticks * 100)
}

pub struct WindowsFrozen {
    process: HANDLE,
    thread: HANDLE,
    job: Option<HANDLE>,
}

unsafe impl Send for WindowsFrozen {}

pub struct WindowsRunning {
    process: HANDLE,
    job: Option<HANDLE>,
    start_instant: Instant,
}

unsafe impl Send for WindowsRunning {}

impl FrozenProcessHandle for WindowsFrozen {
    fn resume(self: Box<Self>) -> Result<Box<dyn RunningProcessHandle>> {
        // spec.md §4.5: retry ResumeThread up to 10x with 100ms backoff
        // until the thread's previous suspend count drops to <= 1.
        let mut attempts = 0;
        loop {
            let previous_count = unsafe { ResumeThread(self.thread) };
            if previous_count == u32::MAX {
                return Err(error::os_error(
                    "ResumeThread",
                    std::io::Error::last_os_error().raw_os_error().unwrap_or(-1),
                ));
            }
            if previous_count <= 1 || attempts >= 10 {
                break;
            }
            attempts += 1;
            std::thread::sleep(Duration::from_millis(100));
        }

        unsafe { CloseHandle(self.thread) };

        Ok(Box::new(WindowsRunning {
            process: self.process,
            job: self.job,
            start_instant: Instant::now(),
        }))
    }

    fn abandon(self: Box<Self>) -> Result<()> {
        unsafe {
            TerminateProcess(self.process, 1);
            CloseHandle(self.thread);
            CloseHandle(self.process);
            if let Some(job) = self.job {
                CloseHandle(job);
            }
        }
        Ok(())
    }
}

impl RunningProcessHandle for WindowsRunning {
    fn poll_usage(&self) -> Result<Usage> {
        let mut creation = unsafe { std::mem::zeroed() };
        let mut exit = unsafe { std::mem::zeroed() };
        let mut kernel = unsafe { std::mem::zeroed() };
        let mut user = unsafe { std::mem::zeroed() };
        unsafe {
            GetProcessTimes(self.process, &mut creation, &mut exit, &mut kernel, &mut user);
        }

        let mut counters: PROCESS_MEMORY_COUNTERS = unsafe { std::mem::zeroed() };
        counters.cb = size_of::<PROCESS_MEMORY_COUNTERS>() as u32;
        let peak_memory = if unsafe {
            GetProcessMemoryInfo(self.process, &mut counters, counters.cb)
        } != 0
        {
            MemorySize::Bytes(counters.PeakWorkingSetSize as u64)
        } else {
            MemorySize::Bytes(0)
        };
        let mut total_processes = 1;
        if let Some(job) = self.job {
            let mut basic: JOBOBJECT_BASIC_ACCOUNTING_INFORMATION = unsafe { std::mem::zeroed() };
            let mut returned = 0u32;
            let ok = unsafe {
                QueryInformationJobObject(
                    job,
                    windows_sys::Win32::System::JobObjects::JobObjectBasicAccountingInformation,
                    &mut basic as *mut _ as *mut _,
                    size_of::<JOBOBJECT_BASIC_ACCOUNTING_INFORMATION>() as u32,
                    &mut returned,
                )
            };
            if ok != 0 {
                total_processes = basic.TotalProcesses.max(1);
            }
        }

        Ok(Usage {
            user_time: filetime_to_duration(user.dwHighDateTime, user.dwLowDateTime),
            kernel_time: filetime_to_duration(kernel.dwHighDateTime, kernel.dwLowDateTime),
            peak_memory,
            total_processes,
        })
    }

    fn poll_exit(&self) -> Result<ExitObservation> {
        let wait = unsafe { WaitForSingleObject(self.process, 0) };
        if wait != 0 {
            return Ok(ExitObservation::StillRunning);
        }
        let mut exit_code = 0u32;
        unsafe {
            windows_sys::Win32::System::Threading::GetExitCodeProcess(self.process, &mut exit_code);
        }
        Ok(ExitObservation::Exited { exit_code })
    }

    fn terminate(&self) -> Result<()> {
        unsafe {
            TerminateProcess(self.process, 1);
        }
        Ok(())
    }

    fn reap(self: Box<Self>) -> Result<()> {
        unsafe {
            WaitForSingleObject(self.process, INFINITE);
            CloseHandle(self.process);
            if let Some(job) = self.job {
                CloseHandle(job);
            }
        }
        Ok(())
    }
}

/// Log on `username`/`password` (spec.md §4.4 step 3) and return a primary
/// token suitable for `CreateProcessAsUserW`. `CreateProcessWithLogonW` is
/// not used here: it silently drops `CREATE_SUSPENDED`, `CREATE_NEW_CONSOLE`
/// and `CREATE_UNICODE_ENVIRONMENT`, which this sandbox always sets, so the
/// logon+as-user pair is the only path that keeps the process freezable.
fn logon_token(username: &str, password: Option<&str>) -> Result<HANDLE> {
    let username_wide = to_wide(username);
    let password_wide = to_wide(password.unwrap_or(""));
    let mut token: HANDLE = 0;
    let ok = unsafe {
        LogonUserW(
            username_wide.as_ptr(),
            std::ptr::null(),
            password_wide.as_ptr(),
            LOGON32_LOGON_INTERACTIVE,
            LOGON32_PROVIDER_DEFAULT,
            &mut token,
        )
    };
    if ok == 0 {
        return Err(error::os_error(
            "LogonUserW",
            std::io::Error::last_os_error().raw_os_error().unwrap_or(-1),
        ));
    }
    Ok(token)
}

/// Create a process in the FROZEN state (spec.md §4.4, Windows algorithm).
/// Selects `CreateProcessAsUserW` over a logon token when `spec.identity` is
/// [`Identity::Windows`], and bare `CreateProcessW` otherwise; both paths
/// share the job-object/injection/UI-restriction code below.
pub fn create_frozen(spec: &SubprocessSpec) -> Result<super::FrozenCreation> {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::System::Threading::STARTF_USESTDHANDLES;

    let argv = spec.command.argv();
    let command_line = argv.join(" ");
    let mut command_line_wide = to_wide(&command_line);

    let stdin = redirect::resolve(&spec.redirects.stdin, StdStream::Stdin)?;
    let stdout = redirect::resolve(&spec.redirects.stdout, StdStream::Stdout)?;
    let stderr = if spec.redirects.join_stderr_to_stdout {
        None
    } else {
        Some(redirect::resolve(&spec.redirects.stderr, StdStream::Stderr)?)
    };

    let mut drainers = Vec::new();
    if let Some(d) = stdout.drainer {
        drainers.push((StdStream::Stdout, d));
    }

    // The desktop must outlive `CreateProcess*`; `STARTUPINFOW::lpDesktop`
    // only borrows its name.
    let desktop = if spec.limits.restrict_ui {
        Some(DesktopHandle::create()?)
    } else {
        None
    };
    let mut desktop_wide = desktop.as_ref().map(|d| to_wide(d.name()));

    let lock = crate::session::fork_lock();
    let _guard = lock.lock().expect("fork lock poisoned");

    let mut startup_info: STARTUPINFOW = unsafe { std::mem::zeroed() };
    startup_info.cb = size_of::<STARTUPINFOW>() as u32;
    if let Some(wide) = &mut desktop_wide {
        startup_info.lpDesktop = wide.as_mut_ptr();
    }
    if stdin.child_file.is_some() || stdout.child_file.is_some() || stderr.is_some() {
        startup_info.dwFlags |= STARTF_USESTDHANDLES;
        if let Some(f) = &stdin.child_file {
            startup_info.hStdInput = f.as_raw_handle() as HANDLE;
        }
        if let Some(f) = &stdout.child_file {
            startup_info.hStdOutput = f.as_raw_handle() as HANDLE;
            if spec.redirects.join_stderr_to_stdout {
                startup_info.hStdError = f.as_raw_handle() as HANDLE;
            }
        }
        if let Some(r) = &stderr {
            if let Some(f) = &r.child_file {
                startup_info.hStdError = f.as_raw_handle() as HANDLE;
            }
        }
    }

    let mut process_info: PROCESS_INFORMATION = unsafe { std::mem::zeroed() };

    let flags = CREATE_SUSPENDED
        | CREATE_BREAKAWAY_FROM_JOB
        | CREATE_NEW_CONSOLE
        | CREATE_NEW_PROCESS_GROUP
        | CREATE_UNICODE_ENVIRONMENT;

    let token = match &spec.identity {
        Some(Identity::Windows { username, password }) => {
            Some(logon_token(username, password.as_deref())?)
        }
        _ => None,
    };

    let ok = match token {
        Some(token) => unsafe {
            let result = CreateProcessAsUserW(
                token,
                std::ptr::null(),
                command_line_wide.as_mut_ptr(),
                std::ptr::null(),
                std::ptr::null(),
                1,
                flags,
                std::ptr::null(),
                std::ptr::null(),
                &startup_info,
                &mut process_info,
            );
            CloseHandle(token);
            result
        },
        None => unsafe {
            CreateProcessW(
                std::ptr::null(),
                command_line_wide.as_mut_ptr(),
                std::ptr::null(),
                std::ptr::null(),
                1,
                flags,
                std::ptr::null(),
                std::ptr::null(),
                &startup_info,
                &mut process_info,
            )
        },
    };

    drop(stdin.child_file);
    drop(stdout.child_file);
    if let Some(r) = stderr {
        if let Some(d) = r.drainer {
            drainers.push((StdStream::Stderr, d));
        }
        drop(r.child_file);
    }

    if ok == 0 {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(-1);
        if errno == 193 {
            return Err(error::user_error(
                "executable is not a valid Windows PE image",
            ));
        }
        return Err(error::os_error("CreateProcessW", errno));
    }

    unsafe {
        windows_sys::Win32::System::Threading::SetPriorityClass(
            process_info.hProcess,
            ABOVE_NORMAL_PRIORITY_CLASS,
        );
    }

    if let Some(mask) = spec.limits.process_affinity_mask {
        let ok = unsafe { SetProcessAffinityMask(process_info.hProcess, mask as usize) };
        if ok == 0 {
            log::warn!(
                "failed to set process affinity mask {:#x}: {}",
                mask,
                std::io::Error::last_os_error()
            );
        }
    }

    for injection in &spec.injections {
        if let Err(e) = inject_dll(process_info.hProcess, &injection.dll_path) {
            unsafe {
                TerminateProcess(process_info.hProcess, 1);
                CloseHandle(process_info.hThread);
                CloseHandle(process_info.hProcess);
            }
            return Err(e);
        }
    }

    let job = if spec.limits.no_job {
        None
    } else {
        match create_job_for(&process_info, spec) {
            Ok(job) => Some(job),
            Err(e) => {
                log::warn!("failed to create job object, continuing job-less: {}", e);
                None
            }
        }
    };

    Ok(super::FrozenCreation {
        handle: Box::new(WindowsFrozen {
            process: process_info.hProcess,
            thread: process_info.hThread,
            job,
        }),
        drainers,
    })
}

fn create_job_for(process_info: &PROCESS_INFORMATION, spec: &SubprocessSpec) -> Result<HANDLE> {
    let job = unsafe { CreateJobObjectW(std::ptr::null(), std::ptr::null()) };
    if job.is_null() {
        return Err(error::os_error(
            "CreateJobObjectW",
            std::io::Error::last_os_error().raw_os_error().unwrap_or(-1),
        ));
    }

    let mut info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = unsafe { std::mem::zeroed() };
    info.BasicLimitInformation.LimitFlags =
        JOB_OBJECT_LIMIT_DIE_ON_UNHANDLED_EXCEPTION | JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;

    if let Some(hard_time) = spec.limits.hard_time_limit {
        info.BasicLimitInformation.LimitFlags |= JOB_OBJECT_LIMIT_PROCESS_TIME;
        info.BasicLimitInformation.PerProcessUserTimeLimit = (hard_time.as_nanos() / 100) as i64;
    }
    if let Some(hard_memory) = spec.limits.hard_memory_limit {
        info.BasicLimitInformation.LimitFlags |= JOB_OBJECT_LIMIT_JOB_MEMORY;
        info.JobMemoryLimit = hard_memory.bytes() as usize;
    }
    if let Some(process_limit) = spec.limits.process_limit {
        info.BasicLimitInformation.LimitFlags |= JOB_OBJECT_LIMIT_ACTIVE_PROCESS;
        info.BasicLimitInformation.ActiveProcessLimit = process_limit;
    }

    let set_ok = unsafe {
        SetInformationJobObject(
            job,
            JobObjectExtendedLimitInformation,
            &info as *const _ as *const _,
            size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
        )
    };
    if set_ok == 0 {
        unsafe { CloseHandle(job) };
        return Err(error::os_error(
            "SetInformationJobObject",
            std::io::Error::last_os_error().raw_os_error().unwrap_or(-1),
        ));
    }

    let assign_ok = unsafe { AssignProcessToJobObject(job, process_info.hProcess) };
    if assign_ok == 0 {
        unsafe { CloseHandle(job) };
        return Err(error::os_error(
            "AssignProcessToJobObject",
            std::io::Error::last_os_error().raw_os_error().unwrap_or(-1),
        ));
    }

    if spec.limits.restrict_ui {
        let mut ui: JOBOBJECT_BASIC_UI_RESTRICTIONS = unsafe { std::mem::zeroed() };
        ui.UIRestrictionsClass = JOB_OBJECT_UILIMIT_HANDLES
            | JOB_OBJECT_UILIMIT_READCLIPBOARD
            | JOB_OBJECT_UILIMIT_WRITECLIPBOARD
            | JOB_OBJECT_UILIMIT_SYSTEMPARAMETERS
            | JOB_OBJECT_UILIMIT_DISPLAYSETTINGS
            | JOB_OBJECT_UILIMIT_GLOBALATOMS
            | JOB_OBJECT_UILIMIT_DESKTOP
            | JOB_OBJECT_UILIMIT_EXITWINDOWS;

        let ui_set_ok = unsafe {
            SetInformationJobObject(
                job,
                JobObjectBasicUIRestrictions,
                &ui as *const _ as *const _,
                size_of::<JOBOBJECT_BASIC_UI_RESTRICTIONS>() as u32,
            )
        };
        if ui_set_ok == 0 {
            unsafe { CloseHandle(job) };
            return Err(error::os_error(
                "SetInformationJobObject",
                std::io::Error::last_os_error().raw_os_error().unwrap_or(-1),
            ));
        }
    }

    Ok(job)
}

/// Inject `dll_path` into `process` by writing its UTF-16 path into a remote
/// page and launching a remote thread at `LoadLibraryW` (spec.md §4.4, step
/// 7). Any failure here is fatal: the caller must terminate the
/// not-yet-unfrozen process.
pub fn inject_dll(process: HANDLE, dll_path: &Path) -> Result<()> {
    let wide = to_wide(&dll_path.to_string_lossy());
    let size = wide.len() * size_of::<u16>();

    let remote = unsafe {
        VirtualAllocEx(
            process,
            std::ptr::null(),
            size,
            MEM_COMMIT,
            PAGE_READWRITE,
        )
    };
    if remote.is_null() {
        return Err(Error::from(error::ErrorKind::InjectionFailed(
            dll_path.display().to_string(),
        )));
    }

    let write_ok = unsafe {
        windows_sys::Win32::System::Diagnostics::Debug::WriteProcessMemory(
            process,
            remote,
            wide.as_ptr() as *const _,
            size,
            std::ptr::null_mut(),
        )
    };
    if write_ok == 0 {
        unsafe { VirtualFreeEx(process, remote, 0, MEM_RELEASE) };
        return Err(Error::from(error::ErrorKind::InjectionFailed(
            dll_path.display().to_string(),
        )));
    }

    let load_library = unsafe {
        let kernel32 = windows_sys::Win32::System::LibraryLoader::GetModuleHandleW(
            to_wide("kernel32.dll").as_ptr(),
        );
        windows_sys::Win32::System::LibraryLoader::GetProcAddress(
            kernel32,
            b"LoadLibraryW\0".as_ptr(),
        )
    };
    let load_library = match load_library {
        Some(addr) => addr,
        None => {
            unsafe { VirtualFreeEx(process, remote, 0, MEM_RELEASE) };
            return Err(Error::from(error::ErrorKind::InjectionFailed(
                dll_path.display().to_string(),
            )));
        }
    };

    let thread = unsafe {
        CreateRemoteThread(
            process,
            std::ptr::null(),
            0,
            Some(std::mem::transmute(load_library)),
            remote,
            0,
            std::ptr::null_mut(),
        )
    };
    if thread.is_null() {
        unsafe { VirtualFreeEx(process, remote, 0, MEM_RELEASE) };
        return Err(Error::from(error::ErrorKind::InjectionFailed(
            dll_path.display().to_string(),
        )));
    }

    unsafe {
        WaitForSingleObject(thread, INFINITE);
        CloseHandle(thread);
        VirtualFreeEx(process, remote, 0, MEM_RELEASE);
    }

    Ok(())
}
