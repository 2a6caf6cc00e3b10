use std::collections::VecDeque;
use std::io::{self, Write};

use nix::unistd::Pid;

/// Ordered process ids belonging to one job, in stage order.
///
/// Append-only while the job's pipeline is being spawned; entries leave only
/// when the foreground wait or the background monitor reaps them.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    pids: VecDeque<Pid>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        ProcessRegistry {
            pids: VecDeque::new(),
        }
    }

    pub fn push_back(&mut self, pid: Pid) {
        self.pids.push_back(pid);
    }

    /// Removes and returns the oldest tracked pid. `None` on an empty
    /// registry; call sites that require non-emptiness treat that as a
    /// contract violation.
    pub fn pop_front(&mut self) -> Option<Pid> {
        self.pids.pop_front()
    }

    /// The lead process of the job (first stage spawned).
    pub fn front(&self) -> Option<Pid> {
        self.pids.front().copied()
    }

    pub fn back(&self) -> Option<Pid> {
        self.pids.back().copied()
    }

    pub fn len(&self) -> usize {
        self.pids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }

    /// Keeps only the pids the predicate accepts. Used by the monitor to
    /// drop reaped processes while preserving stage order.
    pub fn retain<F>(&mut self, f: F)
    where
        F: FnMut(&Pid) -> bool,
    {
        self.pids.retain(f);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pid> {
        self.pids.iter()
    }
}

/// One logical unit of user work: every process spawned for one pipeline.
#[derive(Debug)]
pub struct Job {
    pub id: i32,
    /// The verbatim command line, kept for reporting only.
    pub cmdline: String,
    pub pids: ProcessRegistry,
    /// True once every tracked pid has been reaped.
    pub complete: bool,
}

impl Job {
    /// A fresh job. `id` stays 0 until the scheduler registers the job as a
    /// background job; foreground jobs are discarded without ever getting one.
    pub fn new(cmdline: String) -> Self {
        Job {
            id: 0,
            cmdline,
            pids: ProcessRegistry::new(),
            complete: false,
        }
    }
}

/// Live background jobs in submission order. One per shell process, created
/// lazily on the first pipeline and kept for the life of the shell.
#[derive(Debug)]
pub struct JobRegistry {
    jobs: VecDeque<Job>,
    next_id: i32,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        JobRegistry {
            jobs: VecDeque::new(),
            next_id: 1,
        }
    }

    /// Hands out the next job id. Ids grow monotonically from 1 for the
    /// registry's lifetime; retiring a job never frees its id for reuse.
    pub fn next_id(&mut self) -> i32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn push_back(&mut self, job: Job) {
        self.jobs.push_back(job);
    }

    pub fn pop_front(&mut self) -> Option<Job> {
        self.jobs.pop_front()
    }

    pub fn front(&self) -> Option<&Job> {
        self.jobs.front()
    }

    pub fn back(&self) -> Option<&Job> {
        self.jobs.back()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn find(&self, id: i32) -> Option<&Job> {
        self.jobs.iter().find(|job| job.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter()
    }
}

/// Renders the job status line: `[<id>]\t<pid, width 8>\t<command>`.
/// Scripted tests compare this byte for byte.
pub fn status_line(id: i32, pid: Pid, cmdline: &str) -> String {
    format!("[{}]\t{:>8}\t{}", id, pid.as_raw(), cmdline)
}

pub fn print_job(id: i32, pid: Pid, cmdline: &str) {
    println!("{}", status_line(id, pid, cmdline));
    let _ = io::stdout().flush();
}

pub fn print_job_bg_start(id: i32, pid: Pid, cmdline: &str) {
    print!("Background job started: ");
    print_job(id, pid, cmdline);
}

pub fn print_job_bg_complete(id: i32, pid: Pid, cmdline: &str) {
    print!("Completed: \t");
    print_job(id, pid, cmdline);
}

/// The `jobs` builtin: one status line per tracked job, registry order.
pub fn list_jobs(jobs: &JobRegistry) {
    for job in jobs.iter() {
        match job.pids.front() {
            Some(pid) => print_job(job.id, pid, &job.cmdline),
            None => debug_assert!(false, "job {} tracked with no processes", job.id),
        }
    }
}
