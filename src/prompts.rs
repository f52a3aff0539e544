//! Prompts for VLM-based table extraction.
//!
//! Every piece of text sent to the model lives here so prompt changes never
//! touch retry or validation code, and tests can inspect prompts without a
//! live model.
//!
//! A request is assembled from four parts:
//!
//! 1. [`schema_system_prompt`] — the JSON Schema of the expected answer
//! 2. [`task_instruction`] — names the task and embeds the worked example
//! 3. the page image
//! 4. [`final_prompt`] — the caller's prompt followed by [`DEFAULT_INSTRUCTIONS`]
//!
//! After a validation failure, [`reask_message`] is appended so the model sees
//! what was wrong with its previous answer.

use crate::schema::{response_schema, MultipleTables};

/// Fixed instruction block appended to every user prompt.
pub const DEFAULT_INSTRUCTIONS: &str = r#"Take a moment to reason about the best set of headers for the tables.
Write a good h1 for the image above. Then follow up with a short description of what the data is about.
Then for each table you identified, write a h2 tag that is a descriptive title of the table.
Then follow up with a short description of what the data is about.
Lastly, produce the markdown table for each table you identified.
Make sure to escape the markdown table properly, and make sure to include the caption and the dataframe,
including escaping all the newlines and quotes. Only return a markdown table in dataframe, nothing else."#;

/// Build the system message carrying the response schema.
pub fn schema_system_prompt() -> String {
    let schema = serde_json::to_string_pretty(&response_schema()).unwrap_or_default();
    format!(
        "As a genius expert, your task is to understand the content and provide \
         the parsed objects in json that match the following json_schema:\n\n\
         {schema}\n\n\
         Make sure to return an instance of the JSON, not the schema itself. \
         Return the correct JSON response within a ```json codeblock."
    )
}

/// Build the text that names the task and anchors the output format.
pub fn task_instruction() -> String {
    let example = serde_json::to_string_pretty(&MultipleTables::example()).unwrap_or_default();
    format!("Describe this data accurately as a table in markdown format. {example}")
}

/// The caller's prompt followed by the fixed instruction block.
pub fn final_prompt(user_prompt: &str) -> String {
    format!("{user_prompt}\n{DEFAULT_INSTRUCTIONS}")
}

/// Corrective message sent after an answer failed validation.
pub fn reask_message(validation_error: &str) -> String {
    format!(
        "Your previous answer could not be used: {validation_error}\n\
         Answer again with a single JSON object of the form \
         {{\"tables\": [{{\"caption\": ..., \"dataframe\": ...}}]}} inside a ```json codeblock. \
         Each dataframe must be a markdown pipe table. Use an empty list if the \
         image contains no tables."
    )
}
