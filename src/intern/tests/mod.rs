mod tests_interning;
