use crate::pipeline::scoring::{INTEGRITY_PASS, REALITY_PASS, RELEVANCE_PASS};

pub const APPROVAL_SYSTEM: &str = "You are a marketplace catalog reviewer. Prioritize RELEVANCE and REALISM over pure technical quality.\nReturn strict JSON as requested.";

const APPROVAL_USER_TEMPLATE: &str = "Category: {category}
Goal: choose the best feed cover OR return feedback.

For EACH image, in the order given, produce an object:
{
  'image_hash': str,
  'relevance': float,
  'reality': float,
  'integrity': float,
  'quality': float,
  'verdict': 'APPROVE'|'NEEDS_EDIT'|'NEEDS_COMPLETE_CHANGE',
  'reasons': [str,...]
}

Known image hashes, in order: {hashes}

Rules:
- Apparel: prefer on-model or presenter-holding; flat-lay only if nothing else exists.
- Non-apparel: centered packshot/studio style.
- Reality means photorealistic, not CGI/cartoon.
- Integrity means product identity preserved (color/pattern/shape).
- Quality is advisory only.

After listing all per-image objects as 'per_image', also return a 'global' object:
{
  'decision': 'APPROVED'|'NEEDS_EDIT'|'NEEDS_COMPLETE_CHANGE',
  'chosen_image_hash': str|null,
  'edit_brief': str|null,
  'gen_brief': str|null
}

Output JSON with keys: per_image (list), global (object).";

pub const REAPPROVAL_USER: &str = "Re-evaluate this candidate image for approval using the same JSON schema as before (per_image with exactly one object, plus global).\nCategory: {category}";

pub const PROMPTER_EDIT_SYSTEM: &str =
    "You are an e-commerce retouch lead. Write a precise edit brief that keeps product pixels unchanged.";

const PROMPTER_EDIT_USER_TEMPLATE: &str = "Context feedback:
{feedback}

Return JSON like:
{
  'mode': 'quality_edit',
  'keep_product_pixels': true,
  'operations': ['exposure_correct','white_balance','mild_denoise','mild_sharpen','neutral_studio_bg','soft_shadow','center_crop_1x1'],
  'hard_negatives': ['cartoon','illustration','3D render','CGI','over-airbrushed skin','added text'],
  'acceptance': '{acceptance}'
}";

pub const PROMPTER_GEN_SYSTEM: &str =
    "You are an e-commerce art director. Write a generation plan that keeps product identity faithful.";

const PROMPTER_GEN_USER_TEMPLATE: &str = "Context feedback:
{feedback}
Category: {category}

Return JSON like:
{
  'mode': 'compose_new',
  'scene': 'presenter_holding' or 'on_model' or 'studio_packshot',
  'background': 'neutral_studio_offwhite',
  'camera': 'front, 50mm eq',
  'lighting': 'softbox both sides, soft shadows',
  'crop': '1x1 centered',
  'preserve': ['color','pattern','silhouette'],
  'forbid': ['logos','added text','CGI vibe'],
  'acceptance': '{acceptance}'
}";

pub const EDITOR_SYSTEM: &str =
    "You are a professional photo editor. Obey the edit plan. Do NOT repaint product pixels.";

const EDITOR_USER_TEMPLATE: &str =
    "Apply this edit plan to the attached image and return one photorealistic PNG (1024x1024):\n{plan}";

pub const GENERATOR_SYSTEM: &str =
    "Produce a photorealistic marketplace cover image. Maintain product identity.";

const GENERATOR_USER_TEMPLATE: &str =
    "Create one candidate at 1024x1024 for category '{category}' using this plan:\n{plan}";

pub fn acceptance_sentence() -> String {
    format!(
        "Re-approval must hit Relevance>={RELEVANCE_PASS:.2}, Reality>={REALITY_PASS:.2}, Integrity>={INTEGRITY_PASS:.2}."
    )
}

pub fn approval_user_prompt(category: &str, hashes: &[&str]) -> String {
    APPROVAL_USER_TEMPLATE
        .replace("{category}", category)
        .replace("{hashes}", hashes.join(", ").as_str())
}

pub fn reapproval_user_prompt(category: &str) -> String {
    REAPPROVAL_USER.replace("{category}", category)
}

pub fn edit_planning_prompt(feedback_json: &str) -> String {
    PROMPTER_EDIT_USER_TEMPLATE
        .replace("{feedback}", feedback_json)
        .replace("{acceptance}", acceptance_sentence().as_str())
}

pub fn generate_planning_prompt(feedback_json: &str, category: &str) -> String {
    PROMPTER_GEN_USER_TEMPLATE
        .replace("{feedback}", feedback_json)
        .replace("{category}", category)
        .replace("{acceptance}", acceptance_sentence().as_str())
}

pub fn editor_prompt(plan_json: &str) -> String {
    EDITOR_USER_TEMPLATE.replace("{plan}", plan_json)
}

pub fn generator_prompt(plan_json: &str, category: &str) -> String {
    GENERATOR_USER_TEMPLATE
        .replace("{category}", category)
        .replace("{plan}", plan_json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approval_prompt_lists_category_and_hashes_in_order() {
        let prompt = approval_user_prompt("kurti", &["aaa", "bbb"]);
        assert!(prompt.starts_with("Category: kurti\n"));
        assert!(prompt.contains("Known image hashes, in order: aaa, bbb"));
        assert!(!prompt.contains("{category}"));
    }

    #[test]
    fn planning_prompts_embed_feedback_and_thresholds() {
        let edit = edit_planning_prompt("{\"why\":[\"blurry\"]}");
        assert!(edit.contains("\"why\":[\"blurry\"]"));
        assert!(edit.contains("Relevance>=0.80, Reality>=0.70, Integrity>=0.95"));

        let generate = generate_planning_prompt("{}", "saree");
        assert!(generate.contains("Category: saree"));
        assert!(!generate.contains("{acceptance}"));
    }
}
