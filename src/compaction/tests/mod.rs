mod tests_health;
