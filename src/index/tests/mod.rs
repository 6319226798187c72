mod tests_snapshot;
