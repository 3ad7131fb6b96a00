use std::{
    fmt::Write,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::{ratelimit::Admission, upstream::UpstreamRegistry};

#[derive(Debug, Default)]
pub struct AdmissionMetrics {
    budget_allowed_total: AtomicU64,
    budget_denied_total: AtomicU64,
    budget_failed_open_total: AtomicU64,
    budget_unavailable_total: AtomicU64,
    upstream_allowed_total: AtomicU64,
    upstream_denied_total: AtomicU64,
    upstream_errors_total: AtomicU64,
}

impl AdmissionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn budget_decision(&self, admission: Admission) {
        let counter = match admission {
            Admission::Allowed => &self.budget_allowed_total,
            Admission::Denied => &self.budget_denied_total,
            Admission::FailedOpen => &self.budget_failed_open_total,
            Admission::Unavailable => &self.budget_unavailable_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn upstream_decision(&self, admission: Admission) {
        let counter = if admission.is_allowed() {
            &self.upstream_allowed_total
        } else {
            &self.upstream_denied_total
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn upstream_error(&self) {
        self.upstream_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn render_prometheus(&self, upstreams: &UpstreamRegistry) -> String {
        let mut out = format!(
            concat!(
                "# TYPE budget_admission_allowed_total counter\n",
                "budget_admission_allowed_total {}\n",
                "# TYPE budget_admission_denied_total counter\n",
                "budget_admission_denied_total {}\n",
                "# TYPE budget_failed_open_total counter\n",
                "budget_failed_open_total {}\n",
                "# TYPE budget_admission_unavailable_total counter\n",
                "budget_admission_unavailable_total {}\n",
                "# TYPE upstream_admission_allowed_total counter\n",
                "upstream_admission_allowed_total {}\n",
                "# TYPE upstream_admission_denied_total counter\n",
                "upstream_admission_denied_total {}\n",
                "# TYPE upstream_errors_total counter\n",
                "upstream_errors_total {}\n",
                "# TYPE upstream_auto_tune_rate_limit gauge\n",
            ),
            self.budget_allowed_total.load(Ordering::Relaxed),
            self.budget_denied_total.load(Ordering::Relaxed),
            self.budget_failed_open_total.load(Ordering::Relaxed),
            self.budget_unavailable_total.load(Ordering::Relaxed),
            self.upstream_allowed_total.load(Ordering::Relaxed),
            self.upstream_denied_total.load(Ordering::Relaxed),
            self.upstream_errors_total.load(Ordering::Relaxed),
        );

        let mut limits: Vec<_> = upstreams
            .iter()
            .filter_map(|handle| handle.auto_tune())
            .map(|auto_tune| (auto_tune.upstream_id().to_string(), auto_tune.rate_limit()))
            .collect();
        limits.sort();
        for (upstream, limit) in limits {
            let _ = writeln!(
                out,
                "upstream_auto_tune_rate_limit{{upstream=\"{upstream}\"}} {limit}"
            );
        }

        out
    }
}
