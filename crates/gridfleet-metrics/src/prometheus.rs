//! Prometheus text exposition format.
//!
//! Renders counter snapshots as COUNTER metrics labelled with `category`
//! and `machine`.

use crate::collector::CounterSnapshot;

/// Render counter snapshots into Prometheus text format.
pub fn render_prometheus(snapshots: &[CounterSnapshot]) -> String {
    let mut out = String::new();

    render_counter(
        &mut out,
        "gridfleet_operation_attempts_total",
        "Operation attempts.",
        snapshots,
        |s| s.attempts,
    );
    render_counter(
        &mut out,
        "gridfleet_operation_successes_total",
        "Operations that completed successfully.",
        snapshots,
        |s| s.successes,
    );
    render_counter(
        &mut out,
        "gridfleet_operation_failures_total",
        "Operations that failed.",
        snapshots,
        |s| s.failures,
    );

    out
}

fn render_counter(
    out: &mut String,
    name: &str,
    help: &str,
    snapshots: &[CounterSnapshot],
    value: impl Fn(&CounterSnapshot) -> u64,
) {
    out.push_str(&format!("# HELP {name} {help}\n"));
    out.push_str(&format!("# TYPE {name} counter\n"));
    for s in snapshots {
        out.push_str(&format!(
            "{name}{{category=\"{}\",machine=\"{}\"}} {}\n",
            escape_label(&s.category),
            escape_label(&s.machine),
            value(s)
        ));
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(category: &str) -> CounterSnapshot {
        CounterSnapshot {
            category: category.to_string(),
            machine: "grid-01".to_string(),
            attempts: 10,
            successes: 7,
            failures: 3,
        }
    }

    #[test]
    fn renders_help_and_type() {
        let output = render_prometheus(&[snapshot("GridServerDeployer")]);
        assert!(output.contains("# HELP gridfleet_operation_attempts_total"));
        assert!(output.contains("# TYPE gridfleet_operation_attempts_total counter"));
        assert!(output.contains("# TYPE gridfleet_operation_failures_total counter"));
    }

    #[test]
    fn renders_labelled_values() {
        let output = render_prometheus(&[snapshot("GridServerDeployer")]);
        assert!(output.contains(
            "gridfleet_operation_attempts_total{category=\"GridServerDeployer\",machine=\"grid-01\"} 10"
        ));
        assert!(output.contains(
            "gridfleet_operation_successes_total{category=\"GridServerDeployer\",machine=\"grid-01\"} 7"
        ));
        assert!(output.contains(
            "gridfleet_operation_failures_total{category=\"GridServerDeployer\",machine=\"grid-01\"} 3"
        ));
    }

    #[test]
    fn renders_every_category() {
        let output = render_prometheus(&[snapshot("CheckImage"), snapshot("CreateContainer")]);
        assert_eq!(output.matches("category=\"CheckImage\"").count(), 3);
        assert_eq!(output.matches("category=\"CreateContainer\"").count(), 3);
    }

    #[test]
    fn escapes_label_values() {
        let mut s = snapshot("odd\"name");
        s.machine = "a\\b".to_string();
        let output = render_prometheus(&[s]);
        assert!(output.contains("category=\"odd\\\"name\",machine=\"a\\\\b\""));
    }

    #[test]
    fn empty_snapshots_still_declare_metrics() {
        let output = render_prometheus(&[]);
        assert_eq!(output.lines().count(), 6);
    }
}
