//! Output policies: how a run turns model responses into its final value.
//!
//! An [`OutputSpec<O>`] declares the output type through one or more
//! [`OutputVariant`]s and the channel the model should use:
//!
//! - **Text**: the response text, optionally through a transform.
//! - **Tool**: the model calls an output tool (`final_result`, or
//!   `final_result_<Name>` per variant) whose arguments are the output.
//!   Non-object schemas are wrapped as `{"response": <schema>}`.
//! - **Native**: the backend constrains its text to the schema, which is
//!   passed in [`ModelRequestParameters::output_object`](parley_core::ModelRequestParameters).
//!   Several variants share an envelope:
//!   `{"result": {"kind": <name>, "data": <payload>}}`.
//! - **Prompted**: as native, but the schema is also written into the
//!   request instructions, and Markdown fences are stripped before parsing.
//!
//! Rejected candidates produce an [`OutputError`]; the run feeds it back to
//! the model as a retry prompt.

mod envelope;
mod spec;
mod variant;

pub(crate) use spec::OutputPlan;
pub use spec::{DEFAULT_OUTPUT_TOOL_DESCRIPTION, DEFAULT_OUTPUT_TOOL_NAME, OutputError, OutputSpec};
pub use variant::OutputVariant;
