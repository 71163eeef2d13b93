//! Unit-test generation prompt.
//!
//! The caller supplies a JSON description of the class under test (an AST
//! dump produced elsewhere). It is embedded verbatim; this module never
//! parses it. Cleaning up the model output is left to the caller.

use crate::coordinator::{ChainCoordinator, PipelineRequest};
use crate::error::PipelineError;
use crate::query::QueryExecutor;

const TEST_GENERATION_HEADER: &str = "You are a Java testing assistant.
Below is a JSON array of Abstract Syntax Tree for the class under test. Your task is to generate a complete, idiomatic JUnit 5 unit test class for each public Java method:";

const TEST_GENERATION_RULES: &str = "Rules:
- Use @Test from JUnit 5.
- Resolve all the dependencies. Use Mockito (@Mock, Mockito.when(...), verify(...)) for all dependencies.
- Use @BeforeEach for setting up required preconditions before each test method and @AfterEach for cleanup. Use @BeforeAll (static) if setup is required once before all tests.
- Instantiate the class under test using the proper constructor.
- For each invocation, stub its behavior (when(mock.member(args)).thenReturn(...) for non-void; doNothing().when(...) and verify the method call for void).
- Use Arrange-Act-Assert format.
  - Arrange: set up inputs, mocks, or stubs.
  - Act: call the method under test.
  - Assert: verify the results.
- Make all test methods public.
- Import only what's necessary.
- Return only a complete Java test class, no explanation.
- Return only code in the response, no other text.";

/// Render the test-generation instruction around `payload_json`.
pub fn test_generation_prompt(payload_json: &str) -> String {
    format!(
        "{}\n```\n{}\n```\n{}\n",
        TEST_GENERATION_HEADER,
        payload_json.trim_end(),
        TEST_GENERATION_RULES
    )
}

/// Obtain a ready pipeline and generate tests for `payload_json`.
pub async fn generate_tests(
    coordinator: &ChainCoordinator,
    executor: &QueryExecutor,
    payload_json: &str,
    request: PipelineRequest,
) -> Result<String, PipelineError> {
    let handle = coordinator.get_or_build(request).await?;
    executor
        .execute(&handle, &test_generation_prompt(payload_json))
        .await
}
