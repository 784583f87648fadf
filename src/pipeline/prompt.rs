pub const OUTPUT_LOCALE: &str = "pt-BR";

/// Wraps `template` verbatim in the analysis instructions. The template comes
/// from the template store and is not escaped.
pub fn build_prompt(template: &str, addendum: &str) -> String {
    let mut prompt = format!(
        "You are an expert in analyzing reports. Your task is to analyze the content of the \
         attached file and produce a comprehensive analysis based on the data it contains. \
         Evaluate the information carefully and provide insights about the file. \
         Your response must be an HTML representation of the analysis; it may use tables, \
         bullet points and other visual aids that make the data easier to understand.\n\
         Your HTML must follow the structure of this template:\n\
         {template}\n\
         Do not include any information outside of the provided template. Return only the \
         HTML that belongs inside the template's dynamic body.\n\
         **Important**: all text must be written in Brazilian Portuguese ({OUTPUT_LOCALE}).\n"
    );

    let addendum = addendum.trim();
    if !addendum.is_empty() {
        prompt.push_str("\n**Additional information:**\n");
        prompt.push_str(addendum);
    }

    prompt
}
