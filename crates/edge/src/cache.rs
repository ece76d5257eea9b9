//! Per-caller answer cache of the edge.
//!
//! The edge submits every question under its own gateway session, so it
//! has to remember which of its callers asked what. Results coming off the
//! gateway stream are filed under that caller as `question -> answer`.
//! A result can overtake the submit response that tells the edge who owns
//! it; such results wait in an unclaimed table until the owner is known.

use askq_core::{QueryId, SessionId};
use askq_dispatch::ResultEnvelope;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

struct Submission {
    caller: SessionId,
    question: String,
    submitted_at: Instant,
}

struct Answer {
    question: String,
    answer: String,
    stored_at: Instant,
}

struct Unclaimed {
    answer: String,
    stored_at: Instant,
}

#[derive(Default)]
struct Tables {
    submissions: HashMap<QueryId, Submission>,
    answers: HashMap<SessionId, HashMap<QueryId, Answer>>,
    unclaimed: HashMap<QueryId, Unclaimed>,
}

impl Tables {
    fn file_answer(&mut self, query_id: QueryId, answer: String, now: Instant) -> bool {
        match self.submissions.remove(&query_id) {
            Some(submission) => {
                self.answers.entry(submission.caller).or_default().insert(
                    query_id,
                    Answer {
                        question: submission.question,
                        answer,
                        stored_at: now,
                    },
                );
                true
            }
            None => {
                self.unclaimed.insert(
                    query_id,
                    Unclaimed {
                        answer,
                        stored_at: now,
                    },
                );
                false
            }
        }
    }

    fn evict(&mut self, now: Instant, ttl: Duration) {
        let fresh = |at: &Instant| now.saturating_duration_since(*at) <= ttl;

        self.submissions.retain(|_, s| fresh(&s.submitted_at));
        self.unclaimed.retain(|_, u| fresh(&u.stored_at));
        for answers in self.answers.values_mut() {
            answers.retain(|_, a| fresh(&a.stored_at));
        }
        self.answers.retain(|_, answers| !answers.is_empty());
    }
}

/// Cached answers, keyed by edge caller.
pub struct ResponseCache {
    tables: Mutex<Tables>,
    notify: Notify,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            notify: Notify::new(),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Remember that `caller` asked `question` under `query_id`.
    pub fn record_submission(&self, query_id: QueryId, caller: &SessionId, question: &str) {
        let now = Instant::now();
        let mut tables = self.lock();
        tables.evict(now, self.ttl);

        tables.submissions.insert(
            query_id,
            Submission {
                caller: caller.clone(),
                question: question.to_string(),
                submitted_at: now,
            },
        );

        if let Some(early) = tables.unclaimed.remove(&query_id) {
            tables.file_answer(query_id, early.answer, now);
            drop(tables);
            self.notify.notify_waiters();
        }
    }

    /// File a result from the gateway stream. Returns whether its owner was
    /// already known.
    pub fn insert_result(&self, envelope: ResultEnvelope) -> bool {
        let now = Instant::now();
        let owned = self.lock().file_answer(envelope.query_id, envelope.result, now);
        if owned {
            self.notify.notify_waiters();
        }
        owned
    }

    /// Every unexpired answer of `caller`, as `question -> answer`.
    ///
    /// Reading does not consume; answers stay until they expire.
    pub fn answers_for(&self, caller: &SessionId) -> BTreeMap<String, String> {
        let now = Instant::now();
        let mut tables = self.lock();
        tables.evict(now, self.ttl);

        tables
            .answers
            .get(caller)
            .map(|answers| {
                answers
                    .values()
                    .map(|a| (a.question.clone(), a.answer.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Like [`answers_for`](Self::answers_for), but waits up to `wait` for
    /// a first answer when there is none yet.
    pub async fn wait_for_answers(
        &self,
        caller: &SessionId,
        wait: Duration,
    ) -> BTreeMap<String, String> {
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let answers = self.answers_for(caller);
            if !answers.is_empty() || tokio::time::Instant::now() >= deadline {
                return answers;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.answers_for(caller);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().answers.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn caller(name: &str) -> SessionId {
        SessionId::parse(name).unwrap()
    }

    fn envelope(query_id: QueryId, result: &str) -> ResultEnvelope {
        ResultEnvelope {
            query_id,
            result: result.to_string(),
        }
    }

    #[test]
    fn test_answer_is_filed_under_its_caller() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        let alice = caller("alice");
        let id = QueryId::new_random();

        cache.record_submission(id, &alice, "What is heredity?");
        assert!(cache.insert_result(envelope(id, "Passing traits on.")));

        let answers = cache.answers_for(&alice);
        assert_eq!(
            answers.get("What is heredity?").map(String::as_str),
            Some("Passing traits on.")
        );
        assert!(cache.answers_for(&caller("bob")).is_empty());
    }

    #[test]
    fn test_reads_do_not_consume() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        let alice = caller("alice");
        let id = QueryId::new_random();
        cache.record_submission(id, &alice, "q");
        cache.insert_result(envelope(id, "a"));

        assert_eq!(cache.answers_for(&alice).len(), 1);
        assert_eq!(cache.answers_for(&alice).len(), 1);
    }

    #[test]
    fn test_result_before_submission_is_claimed_later() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        let alice = caller("alice");
        let id = QueryId::new_random();

        assert!(!cache.insert_result(envelope(id, "early")));
        assert!(cache.is_empty());

        cache.record_submission(id, &alice, "fast question");
        assert_eq!(
            cache.answers_for(&alice).get("fast question").map(String::as_str),
            Some("early")
        );
    }

    #[test]
    fn test_answers_expire() {
        let cache = ResponseCache::new(Duration::ZERO);
        let alice = caller("alice");
        let id = QueryId::new_random();
        cache.record_submission(id, &alice, "q");
        cache.insert_result(envelope(id, "a"));

        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.answers_for(&alice).is_empty());
    }

    #[tokio::test]
    async fn test_wait_wakes_on_answer() {
        let cache = Arc::new(ResponseCache::new(Duration::from_secs(60)));
        let alice = caller("alice");
        let id = QueryId::new_random();
        cache.record_submission(id, &alice, "q");

        let writer = Arc::clone(&cache);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.insert_result(envelope(id, "a"));
        });

        let answers = cache.wait_for_answers(&alice, Duration::from_secs(5)).await;
        assert_eq!(answers.len(), 1);
    }

    #[tokio::test]
    async fn test_wait_returns_empty_after_timeout() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        let answers = cache
            .wait_for_answers(&caller("alice"), Duration::from_millis(20))
            .await;
        assert!(answers.is_empty());
    }
}
