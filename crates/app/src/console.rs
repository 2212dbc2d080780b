//! Line-driven console for taking an attempt without a UI.

use exam_core::model::{AnswerValue, AttemptStatus, OptionId, QuestionId};
use services::sessions::{FlushOutcome, SaveStatus};
use services::{CoordinatorError, SessionCoordinator, SessionEvent, SessionView};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

fn print_help() {
    println!("commands:");
    println!("  answer <question-id> <value>   true/false, an option id, ids as 1,3 or text");
    println!("  clear <question-id> | flag <question-id>");
    println!("  go <n> | next | prev           move to question n (1-based)");
    println!("  save | blur | offline | online");
    println!("  pause | resume | submit | quit");
}

/// Drive `coordinator` from stdin until it is submitted or the user quits.
///
/// # Errors
///
/// Returns an error if stdin cannot be read.
pub async fn drive(mut coordinator: SessionCoordinator) -> Result<(), Box<dyn std::error::Error>> {
    let mut events = coordinator.subscribe();
    let printer = tokio::spawn(async move {
        let mut last_shown = None;
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event, &mut last_shown),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "event printer fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    print_help();
    print_view(&coordinator.view());

    let mut ticker = tokio::time::interval(coordinator.tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = coordinator.on_timer().await {
                    println!("submission failed: {err} (type `submit` to retry)");
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    coordinator.save_now().await;
                    break;
                };
                if apply(&mut coordinator, line.trim()).await == Flow::Stop {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                coordinator.save_now().await;
                break;
            }
        }
        if coordinator.result().is_some() {
            break;
        }
    }

    drop(coordinator);
    printer.await?;
    Ok(())
}

async fn apply(coordinator: &mut SessionCoordinator, line: &str) -> Flow {
    let mut parts = line.splitn(3, ' ');
    let command = parts.next().unwrap_or_default();
    let question = parts.next().and_then(|raw| raw.trim().parse::<QuestionId>().ok());
    let current = coordinator.session().current_question_index();

    let result: Result<(), CoordinatorError> = match command {
        "" => Ok(()),
        "answer" | "a" => match (question, parts.next()) {
            (Some(qid), Some(raw)) => coordinator.answer(qid, parse_answer(raw)).await,
            _ => {
                println!("usage: answer <question-id> <value>");
                Ok(())
            }
        },
        "clear" => match question {
            Some(qid) => coordinator.clear_answer(qid).await.map(|_| ()),
            None => {
                println!("usage: clear <question-id>");
                Ok(())
            }
        },
        "flag" => match question {
            Some(qid) => coordinator.toggle_flag(qid).await.map(|_| ()),
            None => {
                println!("usage: flag <question-id>");
                Ok(())
            }
        },
        "go" => {
            let target = line
                .split_whitespace()
                .nth(1)
                .and_then(|raw| raw.parse::<usize>().ok())
                .and_then(|n| n.checked_sub(1));
            match target {
                Some(index) => coordinator.navigate(index).await.map(report_flush),
                None => {
                    println!("usage: go <n>");
                    Ok(())
                }
            }
        }
        "next" => coordinator.navigate(current + 1).await.map(report_flush),
        "prev" => match current.checked_sub(1) {
            Some(index) => coordinator.navigate(index).await.map(report_flush),
            None => Ok(()),
        },
        "save" => {
            report_flush(coordinator.save_now().await);
            Ok(())
        }
        "blur" => {
            report_flush(coordinator.focus_lost().await);
            Ok(())
        }
        "offline" => {
            coordinator.set_online(false).await;
            Ok(())
        }
        "online" => {
            report_flush(coordinator.set_online(true).await);
            Ok(())
        }
        "pause" => coordinator.pause().await,
        "resume" => coordinator.resume().await,
        "submit" => coordinator.submit().await.map(|_| ()),
        "quit" | "exit" => {
            coordinator.save_now().await;
            return Flow::Stop;
        }
        "help" => {
            print_help();
            Ok(())
        }
        other => {
            println!("unknown command: {other}");
            Ok(())
        }
    };

    if let Err(err) = result {
        println!("error: {err}");
    }
    Flow::Continue
}

fn parse_answer(raw: &str) -> AnswerValue {
    let raw = raw.trim();
    match raw {
        "true" => return AnswerValue::Bool(true),
        "false" => return AnswerValue::Bool(false),
        _ => {}
    }
    if let Ok(id) = raw.parse::<u64>() {
        return AnswerValue::Choice(OptionId::new(id));
    }
    if raw.contains(',') {
        let ids: Result<Vec<u64>, _> = raw.split(',').map(|part| part.trim().parse()).collect();
        if let Ok(ids) = ids {
            return AnswerValue::choices(ids);
        }
    }
    AnswerValue::text(raw)
}

fn report_flush(outcome: FlushOutcome) {
    match outcome {
        FlushOutcome::Saved => println!("saved"),
        FlushOutcome::Queued => println!("offline: changes kept locally"),
        FlushOutcome::Failed(failure) => println!("save failed: {}", failure.message),
        FlushOutcome::Skipped | FlushOutcome::Superseded => {}
    }
}

fn print_view(view: &SessionView) {
    println!(
        "question {}/{}  answered {} ({:.0}%)  flagged {}  {}:{:02} left",
        view.current_question_index + 1,
        view.total_questions,
        view.answered,
        view.progress_percentage,
        view.flagged(),
        view.time_remaining / 60,
        view.time_remaining % 60,
    );
}

type Shown = Option<(usize, usize, usize, AttemptStatus)>;

fn print_event(event: &SessionEvent, last_shown: &mut Shown) {
    match event {
        SessionEvent::StateChanged(view) => {
            // the timer republishes every tick; only show real changes
            let key = (
                view.current_question_index,
                view.answered,
                view.flagged(),
                view.status,
            );
            if *last_shown != Some(key) {
                *last_shown = Some(key);
                print_view(view);
            }
        }
        SessionEvent::SaveStatusChanged(status) => match status {
            SaveStatus::Saved { .. } => println!("[all changes saved]"),
            SaveStatus::Unsaved { last_error: Some(err) } => println!("[unsaved: {err}]"),
            SaveStatus::Unsaved { last_error: None } => println!("[unsaved changes]"),
            SaveStatus::Offline => println!("[offline]"),
        },
        SessionEvent::TimeWarning(warning) => {
            println!("{} minute(s) left", warning.minutes);
        }
        SessionEvent::ResumedFromBackground { charged_secs } => {
            println!("welcome back: {charged_secs}s passed while away");
        }
        SessionEvent::ForcedSubmit => println!("time is up, submitting"),
        SessionEvent::Submitted(result) => println!(
            "submitted: {}/{} ({:.1}%), {} correct, {} incorrect, {} unanswered",
            result.score,
            result.max_score,
            result.percentage,
            result.correct,
            result.incorrect,
            result.unanswered,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answers_parse_by_shape() {
        assert_eq!(parse_answer("true"), AnswerValue::Bool(true));
        assert_eq!(parse_answer(" 4 "), AnswerValue::Choice(OptionId::new(4)));
        assert_eq!(parse_answer("1, 3"), AnswerValue::choices([1, 3]));
        assert_eq!(parse_answer("photosynthesis"), AnswerValue::text("photosynthesis"));
        assert_eq!(parse_answer("1,x"), AnswerValue::text("1,x"));
    }
}
