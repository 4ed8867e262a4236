pub mod code_review;

use crate::registry::ToolRegistry;

/// Register every built-in tool.
pub fn register_all(registry: &mut ToolRegistry) {
    // Names are non-empty constants, so registration cannot fail.
    let _ = registry.register(code_review::ExtractFunctionsTool);
    let _ = registry.register(code_review::CheckComplexityTool);
    let _ = registry.register(code_review::DetectIssuesTool);
    let _ = registry.register(code_review::SuggestImprovementsTool);
    let _ = registry.register(code_review::SummarizeReviewTool);
}
