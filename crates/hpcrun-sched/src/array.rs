//! Job arrays: one submission, many indexed tasks.

use std::fmt;

use crate::error::{SchedError, SchedResult};
use crate::job::Job;

/// A job template run once per index in `start..=end` stepping by `step`.
#[derive(Debug, Clone)]
pub struct JobArray {
    job: Job,
    start: u32,
    end: u32,
    step: u32,
    max_concurrent: Option<u32>,
}

impl JobArray {
    /// Create an array over `start..=end` with step 1.
    pub fn new(job: Job, start: u32, end: u32) -> SchedResult<Self> {
        if start > end {
            return Err(SchedError::InvalidArrayRange(format!(
                "start {start} is greater than end {end}"
            )));
        }
        Ok(Self {
            job,
            start,
            end,
            step: 1,
            max_concurrent: None,
        })
    }

    /// Parse the canonical `start-end[:step][%max]` form.
    pub fn from_range(job: Job, range: &str) -> SchedResult<Self> {
        let invalid = || SchedError::InvalidArrayRange(range.to_string());
        let number = |s: &str| s.trim().parse::<u32>().map_err(|_| invalid());

        let (range_part, max_concurrent) = match range.split_once('%') {
            Some((r, m)) => (r, Some(number(m)?)),
            None => (range, None),
        };
        let (bounds, step) = match range_part.split_once(':') {
            Some((b, s)) => (b, Some(number(s)?)),
            None => (range_part, None),
        };
        let (start, end) = match bounds.split_once('-') {
            Some((s, e)) => (number(s)?, number(e)?),
            None => {
                let single = number(bounds)?;
                (single, single)
            }
        };

        let mut array = Self::new(job, start, end)?;
        if let Some(step) = step {
            array = array.with_step(step)?;
        }
        if let Some(max) = max_concurrent {
            array = array.with_max_concurrent(max)?;
        }
        Ok(array)
    }

    pub fn with_step(mut self, step: u32) -> SchedResult<Self> {
        if step == 0 {
            return Err(SchedError::InvalidArrayRange("step must be at least 1".into()));
        }
        self.step = step;
        Ok(self)
    }

    pub fn with_max_concurrent(mut self, max: u32) -> SchedResult<Self> {
        if max == 0 {
            return Err(SchedError::InvalidArrayRange(
                "max_concurrent must be at least 1".into(),
            ));
        }
        self.max_concurrent = Some(max);
        Ok(self)
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn job_mut(&mut self) -> &mut Job {
        &mut self.job
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    pub fn step(&self) -> u32 {
        self.step
    }

    pub fn max_concurrent(&self) -> Option<u32> {
        self.max_concurrent
    }

    /// `start-end`, then `:step` when step is not 1, then `%max` when throttled.
    pub fn range_str(&self) -> String {
        let mut range = format!("{}-{}", self.start, self.end);
        if self.step != 1 {
            range.push_str(&format!(":{}", self.step));
        }
        if let Some(max) = self.max_concurrent {
            range.push_str(&format!("%{max}"));
        }
        range
    }

    /// `start-end[:step]` without the throttle, for backends that take it separately.
    pub fn bounds_str(&self) -> String {
        if self.step == 1 {
            format!("{}-{}", self.start, self.end)
        } else {
            format!("{}-{}:{}", self.start, self.end, self.step)
        }
    }

    /// The task indices. Each call starts a fresh iteration.
    pub fn indices(&self) -> ArrayIndices {
        ArrayIndices {
            next: Some(self.start),
            end: self.end,
            step: self.step,
        }
    }

    /// Number of tasks.
    pub fn len(&self) -> usize {
        ((self.end - self.start) / self.step) as usize + 1
    }

    /// Arrays always hold at least one task.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Whether `index` is one of this array's tasks.
    pub fn contains(&self, index: u32) -> bool {
        index >= self.start && index <= self.end && (index - self.start) % self.step == 0
    }
}

impl fmt::Display for JobArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.job.name(), self.range_str())
    }
}

/// Lazy iterator over array task indices (inclusive upper bound).
#[derive(Debug, Clone)]
pub struct ArrayIndices {
    next: Option<u32>,
    end: u32,
    step: u32,
}

impl Iterator for ArrayIndices {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        let current = self.next?;
        if current > self.end {
            self.next = None;
            return None;
        }
        self.next = current.checked_add(self.step);
        Some(current)
    }
}

/// Identifier of one array task, identical for every backend.
pub fn task_id(base_id: &str, index: u32) -> String {
    format!("{base_id}_{index}")
}

/// Split `"{base}_{index}"` back into its parts.
pub fn split_task_id(task_id: &str) -> Option<(&str, u32)> {
    let (base, index) = task_id.rsplit_once('_')?;
    if base.is_empty() {
        return None;
    }
    index.parse().ok().map(|i| (base, i))
}
