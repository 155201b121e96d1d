use indoc::formatdoc;

use crate::{
    check_run::JobReport,
    github_client::{CheckRunAction, CheckRunOutput},
};

pub const FLAG_ON_ACTION: &str = "turn_on";
pub const FLAG_OFF_ACTION: &str = "turn_off";

/// Output and buttons sent along with a check run transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckRunView {
    pub output: Option<CheckRunOutput>,
    pub actions: Vec<CheckRunAction>,
}

impl CheckRunView {
    pub fn queued(delivery_id: &str) -> Self {
        Self::with_output(
            "Waiting for the job",
            with_debug_info("The check run is queued.".to_owned(), delivery_id),
            String::new(),
        )
    }

    pub fn in_progress(delivery_id: &str) -> Self {
        Self::with_output(
            "Running the job",
            with_debug_info("The job has started.".to_owned(), delivery_id),
            String::new(),
        )
    }

    pub fn from_report(report: &JobReport, delivery_id: &str) -> Self {
        let mut view = Self::with_output(
            &report.title,
            with_debug_info(report.summary.clone(), delivery_id),
            report.text.clone(),
        );
        view.actions = flag_actions();
        view
    }

    pub fn timed_out(timeout: humantime::Duration, delivery_id: &str) -> Self {
        Self::with_output(
            "Running job timed out",
            with_debug_info(
                format!("Job execution has timed out ({timeout})."),
                delivery_id,
            ),
            String::new(),
        )
    }

    pub fn job_failed(error: &anyhow::Error, delivery_id: &str) -> Self {
        Self::with_output(
            "Failed to run the job",
            with_debug_info(
                "Event handling failed, contact operation team.".to_owned(),
                delivery_id,
            ),
            // Use Debug trait here to include ancestor errors.
            format!("Error:\n\n```\n{error:?}\n```"),
        )
    }

    pub fn skipped(label: &str, delivery_id: &str) -> Self {
        Self::with_output(
            "Skipped",
            with_debug_info(
                format!("The pull request is labeled with `{label}`."),
                delivery_id,
            ),
            String::new(),
        )
    }

    fn with_output(title: &str, summary: String, text: String) -> Self {
        Self {
            output: Some(CheckRunOutput {
                title: title.to_owned(),
                summary,
                text,
            }),
            actions: Vec::new(),
        }
    }
}

fn flag_actions() -> Vec<CheckRunAction> {
    vec![
        CheckRunAction {
            label: "Turn on".to_owned(),
            description: "Set the flag commit status to success".to_owned(),
            identifier: FLAG_ON_ACTION.to_owned(),
        },
        CheckRunAction {
            label: "Turn off".to_owned(),
            description: "Set the flag commit status to failure".to_owned(),
            identifier: FLAG_OFF_ACTION.to_owned(),
        },
    ]
}

fn with_debug_info(original: String, delivery_id: &str) -> String {
    formatdoc! {"
        {original}

        Delivery ID (not unique for re-delivery): `{delivery_id}`"
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::check_run::Conclusion;

    #[test]
    fn report_view_has_flag_actions() {
        let report = JobReport {
            conclusion: Conclusion::Success,
            title: "Job succeeded".to_owned(),
            summary: "ok".to_owned(),
            text: "details".to_owned(),
        };
        let view = CheckRunView::from_report(&report, "d-1");
        let output = view.output.unwrap();
        assert_eq!(output.title, "Job succeeded");
        assert_eq!(
            output.summary,
            "ok\n\nDelivery ID (not unique for re-delivery): `d-1`"
        );
        assert_eq!(output.text, "details");
        let ids = view
            .actions
            .iter()
            .map(|a| a.identifier.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![FLAG_ON_ACTION, FLAG_OFF_ACTION]);
    }

    #[test]
    fn action_fields_fit_github_limits() {
        for a in flag_actions() {
            assert!(a.label.len() <= 20, "{}", a.label);
            assert!(a.description.len() <= 40, "{}", a.description);
            assert!(a.identifier.len() <= 20, "{}", a.identifier);
        }
    }

    #[test]
    fn failed_view_includes_error_chain() {
        let err = anyhow!("root cause").context("failed to run command: make");
        let view = CheckRunView::job_failed(&err, "d-2");
        let text = view.output.unwrap().text;
        assert!(text.contains("failed to run command: make"));
        assert!(text.contains("root cause"));
        assert!(view.actions.is_empty());
    }

    #[test]
    fn timed_out_mentions_duration() {
        let view = CheckRunView::timed_out("10m".parse().unwrap(), "d-3");
        assert!(view.output.unwrap().summary.starts_with("Job execution has timed out (10m)."));
    }
}
