mod tests_header;
mod tests_layout;
