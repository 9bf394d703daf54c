use std::collections::BTreeMap;
use std::future::Future;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::params::{utcnow, IntoParam, Param, Params};
use crate::step_queue::error::TaskError;
use crate::step_queue::queue::StepQueue;

/// A named, timestamped span within a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub start: NaiveDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<NaiveDateTime>,
    /// Seconds between `start` and `stop`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

impl Step {
    fn running(&self) -> bool {
        self.stop.is_none()
    }
}

/// The in-memory view of one claimed task.
///
/// Created at a successful claim ([`StepQueue::start`]) or re-attachment
/// ([`StepQueue::checkout`]); destroyed when the task finishes or the claim
/// expires. Every mutation is a conditional UPDATE guarded by the task id,
/// this handler's execution id, and claim liveness; a guard that affects
/// zero rows becomes [`TaskError::TaskDoesNotExist`].
pub struct TaskHandler {
    task_id: u64,
    execution_id: String,
    data: serde_json::Value,
    steps: Vec<Step>,
    started: Option<NaiveDateTime>,
    finished: Option<NaiveDateTime>,
    queue: StepQueue,
}

impl TaskHandler {
    pub(crate) async fn attach(
        queue: StepQueue,
        task_id: u64,
        execution_id: String,
    ) -> Result<TaskHandler, TaskError> {
        let mut handler = TaskHandler {
            task_id,
            execution_id,
            data: serde_json::Value::Null,
            steps: Vec::new(),
            started: None,
            finished: None,
            queue,
        };
        handler.refresh().await?;
        Ok(handler)
    }

    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    /// The 32-char token identifying this claim.
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn data(&self) -> &serde_json::Value {
        &self.data
    }

    /// Mutable access to the cached payload; [`save`](TaskHandler::save)
    /// persists it.
    pub fn data_mut(&mut self) -> &mut serde_json::Value {
        &mut self.data
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn started(&self) -> Option<NaiveDateTime> {
        self.started
    }

    pub fn finished(&self) -> Option<NaiveDateTime> {
        self.finished
    }

    /// Re-reads whether this claim is still live. `false` once the task is
    /// locally finished or the claim expired.
    pub async fn valid(&self) -> Result<bool, TaskError> {
        if self.finished.is_some() {
            return Ok(false);
        }

        let sql = format!(
            r"SELECT (last_contact > %(now)s - INTERVAL %(ttl)s SECOND) AS valid
FROM `{table}`
WHERE
    id = %(task_id)s
    AND execution_id = %(execution_id)s",
            table = self.queue.table_name(),
        );

        let mut conn = self.conn().await?;
        let row = conn
            .get(&sql, self.guard_params(None))
            .await
            .map_err(TaskError::Database)?;

        match row {
            Some(row) => {
                let valid: Option<i64> = row.get("valid").map_err(TaskError::Database)?;
                Ok(valid == Some(1))
            }
            None => Ok(false),
        }
    }

    /// Heartbeat: notifies the queue that this task is still active.
    pub async fn ping(&mut self) -> Result<(), TaskError> {
        if self.finished.is_some() {
            return Err(TaskError::AlreadyFinished);
        }

        let sql = format!(
            r"UPDATE `{table}`
SET
    last_contact = %(now)s,
    update_count = update_count + 1
WHERE
    id = %(task_id)s
    AND execution_id = %(execution_id)s
    AND last_contact > %(now)s - INTERVAL %(ttl)s SECOND",
            table = self.queue.table_name(),
        );

        let mut conn = self.conn().await?;
        let affected = conn
            .query(&sql, self.guard_params(None))
            .await
            .map_err(TaskError::Database)?
            .affected();

        if affected != 1 {
            return Err(TaskError::TaskDoesNotExist);
        }
        Ok(())
    }

    /// Finishes the task with result `success`.
    pub async fn finish(&mut self) -> Result<(), TaskError> {
        self.finish_with("success").await
    }

    /// Finishes the task, recording `result` under the payload's `result`
    /// key (and thereby in the computed `result` column).
    pub async fn finish_with(&mut self, result: &str) -> Result<(), TaskError> {
        if self.running_steps() != 0 {
            return Err(TaskError::StepRunning);
        }
        if self.finished.is_some() {
            return Err(TaskError::AlreadyFinished);
        }

        let mut data = self.data.clone();
        if let Some(map) = data.as_object_mut() {
            map.insert("result".to_owned(), serde_json::Value::from(result));
        }
        self.persist(Some(utcnow()), None, Some(data)).await
    }

    /// Returns the task to the queue as if it had never been claimed: all
    /// execution fields cleared, the `result` key removed from the payload.
    pub async fn requeue(&mut self) -> Result<(), TaskError> {
        if self.running_steps() != 0 {
            return Err(TaskError::StepRunning);
        }
        if self.finished.is_some() {
            return Err(TaskError::AlreadyFinished);
        }

        let sql = format!(
            r"UPDATE `{table}`
SET
    last_contact = NULL,
    update_count = update_count + 1,
    started = NULL,
    steps = NULL,
    execution_id = NULL,
    finished = NULL,
    data = JSON_DELETE_KEY(data, 'result')
WHERE
    id = %(task_id)s
    AND execution_id = %(execution_id)s
    AND last_contact > %(now)s - INTERVAL %(ttl)s SECOND",
            table = self.queue.table_name(),
        );

        let mut conn = self.conn().await?;
        let affected = conn
            .query(&sql, self.guard_params(None))
            .await
            .map_err(TaskError::Database)?
            .affected();

        if affected != 1 {
            return Err(TaskError::TaskDoesNotExist);
        }
        Ok(())
    }

    /// Starts the named step.
    pub async fn start_step(&mut self, step_name: &str) -> Result<(), TaskError> {
        if self.finished.is_some() {
            return Err(TaskError::AlreadyFinished);
        }
        match self.get_step(step_name) {
            Some(step) if step.running() => return Err(TaskError::StepAlreadyStarted),
            Some(_) => return Err(TaskError::StepAlreadyFinished),
            None => {}
        }

        let mut steps = self.steps.clone();
        steps.push(Step {
            name: step_name.to_owned(),
            start: utcnow(),
            stop: None,
            duration: None,
        });
        self.persist(None, Some(steps), None).await
    }

    /// Stops the named step, recording its duration in seconds.
    pub async fn stop_step(&mut self, step_name: &str) -> Result<(), TaskError> {
        if self.finished.is_some() {
            return Err(TaskError::AlreadyFinished);
        }

        let mut steps = self.steps.clone();
        let step = match steps.iter_mut().find(|step| step.name == step_name) {
            None => return Err(TaskError::StepNotStarted),
            Some(step) if step.stop.is_some() => return Err(TaskError::StepAlreadyFinished),
            Some(step) => step,
        };

        let stop = utcnow();
        step.duration = Some((stop - step.start).num_microseconds().unwrap_or(0) as f64 / 1e6);
        step.stop = Some(stop);
        self.persist(None, Some(steps), None).await
    }

    /// Runs `body` inside the named step: the step starts on entry and
    /// stops only when `body` succeeds. On failure the step stays open, so
    /// the task is reclaimed through TTL expiry rather than marked clean.
    pub async fn step<T, E, Fut>(
        &mut self,
        step_name: &str,
        body: Fut,
    ) -> Result<Result<T, E>, TaskError>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        self.start_step(step_name).await?;
        let output = body.await;
        if output.is_ok() {
            self.stop_step(step_name).await?;
        }
        Ok(output)
    }

    /// Re-reads the row; fails with [`TaskError::TaskDoesNotExist`] when
    /// this claim is no longer live.
    pub async fn refresh(&mut self) -> Result<(), TaskError> {
        let sql = format!(
            r"SELECT * FROM `{table}`
WHERE
    id = %(task_id)s
    AND execution_id = %(execution_id)s
    AND last_contact > %(now)s - INTERVAL %(ttl)s SECOND",
            table = self.queue.table_name(),
        );

        let mut conn = self.conn().await?;
        let row = conn
            .get(&sql, self.guard_params(None))
            .await
            .map_err(TaskError::Database)?
            .ok_or(TaskError::TaskDoesNotExist)?;

        self.data = row
            .get_json::<serde_json::Value>("data")
            .map_err(TaskError::Database)?
            .unwrap_or(serde_json::Value::Null);
        self.steps = row
            .get_json::<Vec<Step>>("steps")
            .map_err(TaskError::Database)?
            .unwrap_or_default();
        self.started = row.get_datetime("started").map_err(TaskError::Database)?;
        self.finished = row.get_datetime("finished").map_err(TaskError::Database)?;
        Ok(())
    }

    /// Persists the cached payload and steps.
    pub async fn save(&mut self) -> Result<(), TaskError> {
        self.persist(None, None, None).await
    }

    fn get_step(&self, step_name: &str) -> Option<&Step> {
        self.steps.iter().find(|step| step.name == step_name)
    }

    fn running_steps(&self) -> usize {
        self.steps.iter().filter(|step| step.running()).count()
    }

    async fn conn(&self) -> Result<crate::pool::PoolFairy, TaskError> {
        self.queue
            .inner
            .utility
            .conn()
            .await
            .map_err(TaskError::Database)
    }

    /// The parameters every guarded statement shares, plus any extras.
    fn guard_params(&self, extra: Option<BTreeMap<String, Param>>) -> Params {
        let mut map = extra.unwrap_or_default();
        map.insert("now".to_owned(), Param::datetime(utcnow()));
        map.insert("ttl".to_owned(), Param::value(self.queue.execution_ttl()));
        map.insert("task_id".to_owned(), Param::value(self.task_id));
        map.insert(
            "execution_id".to_owned(),
            Param::value(self.execution_id.clone()),
        );
        Params::Named(map)
    }

    /// Writes `finished`, `steps`, and `data` (falling back to the cached
    /// values) under the liveness guard, then adopts the written values.
    async fn persist(
        &mut self,
        finished: Option<NaiveDateTime>,
        steps: Option<Vec<Step>>,
        data: Option<serde_json::Value>,
    ) -> Result<(), TaskError> {
        let sql = format!(
            r"UPDATE `{table}`
SET
    last_contact = %(now)s,
    update_count = update_count + 1,
    steps = %(steps)s,
    finished = %(finished)s,
    data = %(data)s
WHERE
    id = %(task_id)s
    AND execution_id = %(execution_id)s
    AND last_contact > %(now)s - INTERVAL %(ttl)s SECOND",
            table = self.queue.table_name(),
        );

        let write_finished = finished.or(self.finished);
        let write_steps = steps.as_deref().unwrap_or(&self.steps);
        let write_data = data.as_ref().unwrap_or(&self.data);

        let params = BTreeMap::from([
            ("steps".to_owned(), Param::json(&write_steps)?),
            ("finished".to_owned(), write_finished.into_param()),
            ("data".to_owned(), Param::json(write_data)?),
        ]);

        let mut conn = self.conn().await?;
        let affected = conn
            .query(&sql, self.guard_params(Some(params)))
            .await
            .map_err(TaskError::Database)?
            .affected();

        if affected != 1 {
            return Err(TaskError::TaskDoesNotExist);
        }

        if let Some(steps) = steps {
            self.steps = steps;
        }
        if let Some(finished) = finished {
            self.finished = Some(finished);
        }
        if let Some(data) = data {
            self.data = data;
        }
        Ok(())
    }
}

impl std::fmt::Debug for TaskHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandler")
            .field("task_id", &self.task_id)
            .field("execution_id", &self.execution_id)
            .field("finished", &self.finished)
            .finish()
    }
}
