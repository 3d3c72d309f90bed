use device_bridge::CommandRunner;
use inspector_mux::{InstanceConnection, MuxError, ScenarioDriver};
use serde::Serialize;
use serde_json::{Value, json};

/// Typed request surface over per-instance debugger connections.
///
/// Every call mints a fresh message id, sends `{"id", "method", "params"?}`
/// and waits for the response carrying that id back. A response with any
/// other id fails the scenario.
pub struct InspectorApi<'a, R> {
    driver: &'a ScenarioDriver<R>,
}

/// `Profiler.setSamplingInterval` parameters, in microseconds.
#[derive(Debug, Serialize)]
pub struct SamplingInterval {
    pub interval: u32,
}

impl<'a, R: CommandRunner> InspectorApi<'a, R> {
    pub fn new(driver: &'a ScenarioDriver<R>) -> Self {
        Self { driver }
    }

    /// Parameterless method call.
    pub async fn call(
        &self,
        connection: &mut InstanceConnection,
        method: &str,
    ) -> Result<Value, MuxError> {
        self.request(connection, method, None::<()>, 1).await
    }

    pub async fn call_with_params<P: Serialize>(
        &self,
        connection: &mut InstanceConnection,
        method: &str,
        params: P,
    ) -> Result<Value, MuxError> {
        self.request(connection, method, Some(params), 1).await
    }

    /// Like [`call`](Self::call), for methods whose response comes with
    /// `counts - 1` extra event frames that should be drained, not surfaced.
    pub async fn call_counted(
        &self,
        connection: &mut InstanceConnection,
        method: &str,
        counts: usize,
    ) -> Result<Value, MuxError> {
        self.request(connection, method, None::<()>, counts).await
    }

    async fn request<P: Serialize>(
        &self,
        connection: &mut InstanceConnection,
        method: &str,
        params: Option<P>,
        counts: usize,
    ) -> Result<Value, MuxError> {
        let id = self.driver.next_message_id();
        let mut request = json!({"id": id, "method": method});
        if let Some(params) = params {
            request["params"] = serde_json::to_value(params)?;
        }
        self.driver.send_to_instance(connection, request)?;

        let reply: Value =
            serde_json::from_str(&self.driver.recv_from_instance(connection, counts).await?)?;
        if reply["id"] != id {
            return Err(MuxError::ResponseMismatch {
                expected_id: id,
                actual: reply.to_string(),
            });
        }
        Ok(reply)
    }
}
