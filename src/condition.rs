//! Condition evaluator (§4.6): preconditions gating node admission, and the
//! probe used by condition-based repeat policies.

use crate::env::Env;
use crate::error::SchedulerError;
use crate::step::Condition;
use std::process::Stdio;
use tokio::process::Command;

/// Evaluates a single condition. A condition with both `condition` and
/// `command` blank is vacuously met (no probe configured).
pub async fn evaluate(condition: &Condition, env: &Env) -> Result<(), SchedulerError> {
    if !condition.condition.is_empty() {
        return evaluate_value(condition, env).await;
    }
    if !condition.command.is_empty() {
        return evaluate_command(condition, env).await;
    }
    Ok(())
}

/// Evaluates a sequence of conditions, failing fast on the first unmet one.
pub async fn evaluate_all(conditions: &[Condition], env: &Env) -> Result<(), SchedulerError> {
    for condition in conditions {
        evaluate(condition, env).await?;
    }
    Ok(())
}

async fn evaluate_value(condition: &Condition, env: &Env) -> Result<(), SchedulerError> {
    let actual = env.eval_string(&condition.condition).await?;
    let matched = Env::matches_expected(&actual, &condition.expected)?;
    if matched {
        Ok(())
    } else {
        Err(SchedulerError::ConditionNotMet(format!(
            "'{}' evaluated to '{actual}', expected '{}'",
            condition.condition, condition.expected
        )))
    }
}

async fn evaluate_command(condition: &Condition, env: &Env) -> Result<(), SchedulerError> {
    let cmd = env.eval_string(&condition.command).await?;
    let shell = crate::env::resolve_shell(None).unwrap_or_else(|| "/bin/sh".to_string());
    let status = Command::new(&shell)
        .arg("-c")
        .arg(&cmd)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map_err(|e| SchedulerError::ConditionNotMet(format!("'{cmd}': {e}")))?;

    if status.success() {
        Ok(())
    } else {
        Err(SchedulerError::ConditionNotMet(format!(
            "'{cmd}' exited with {status}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_condition_is_vacuously_met() {
        let env = Env::new();
        assert!(evaluate(&Condition::default(), &env).await.is_ok());
    }

    #[tokio::test]
    async fn value_condition_matches_exact() {
        let mut env = Env::new();
        env.store("STATUS", "0");
        let cond = Condition {
            condition: "${STATUS}".into(),
            expected: "0".into(),
            ..Default::default()
        };
        assert!(evaluate(&cond, &env).await.is_ok());
    }

    #[tokio::test]
    async fn value_condition_mismatch_is_not_met() {
        let mut env = Env::new();
        env.store("STATUS", "1");
        let cond = Condition {
            condition: "${STATUS}".into(),
            expected: "0".into(),
            ..Default::default()
        };
        let err = evaluate(&cond, &env).await.unwrap_err();
        assert!(err.is_condition_not_met());
    }

    #[tokio::test]
    async fn value_condition_supports_regex_expected() {
        let mut env = Env::new();
        env.store("NAME", "build-42");
        let cond = Condition {
            condition: "${NAME}".into(),
            expected: "re:^build-\\d+$".into(),
            ..Default::default()
        };
        assert!(evaluate(&cond, &env).await.is_ok());
    }

    #[tokio::test]
    async fn command_condition_success_exit_code() {
        let env = Env::new();
        let cond = Condition {
            command: "true".into(),
            ..Default::default()
        };
        assert!(evaluate(&cond, &env).await.is_ok());
    }

    #[tokio::test]
    async fn command_condition_failure_is_not_met() {
        let env = Env::new();
        let cond = Condition {
            command: "false".into(),
            ..Default::default()
        };
        let err = evaluate(&cond, &env).await.unwrap_err();
        assert!(err.is_condition_not_met());
    }

    #[tokio::test]
    async fn sequence_fails_fast_on_first_unmet() {
        let env = Env::new();
        let conditions = vec![
            Condition {
                command: "true".into(),
                ..Default::default()
            },
            Condition {
                command: "false".into(),
                ..Default::default()
            },
            Condition {
                command: "exit 2".into(),
                ..Default::default()
            },
        ];
        let err = evaluate_all(&conditions, &env).await.unwrap_err();
        assert!(err.is_condition_not_met());
        assert!(err.to_string().contains("exited"));
    }
}
